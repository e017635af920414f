//! Remote filesystem access over multiplexed SSH.
//!
//! Dependency order is [`cache`] → [`connection`] → [`manager`]; callers
//! normally only touch [`ConnectionManager`] and the [`RemoteConnection`]s
//! it hands out.

pub mod cache;
pub mod connection;
pub mod error;
pub mod listing;
pub mod manager;
pub mod path;
pub mod runner;
pub mod types;

pub use cache::{CacheOperation, CacheStats, ResultCache};
pub use connection::{ProgressCallback, RemoteConnection};
pub use error::{ErrorKind, RemoteError};
pub use manager::{shutdown, ConnectionManager};
pub use path::RemoteUri;
pub use runner::{CommandOutput, CommandRunner, ProcessRunner, RunError};
pub use types::{CachedData, RemoteEntry};
