//! SSH/SFTP remote-access core for a dual-pane terminal file manager.
//!
//! [`remote`] holds the connection pool, the per-host connection and the
//! result cache. [`config`], [`hosts`] and [`ssh_config`] supply the host
//! definitions they are driven by.

pub mod config;
pub mod hosts;
pub mod models;
pub mod remote;
pub mod ssh_config;
