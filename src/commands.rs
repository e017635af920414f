use anyhow::{bail, Context, Result};
use chrono::{Local, TimeZone};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tfm_remote::hosts::HostRegistry;
use tfm_remote::remote::{
    path, ConnectionManager, ProgressCallback, RemoteConnection, RemoteEntry, RemoteUri,
};

use crate::Commands;

pub fn run(command: &Commands, registry: &HostRegistry, json: bool) -> Result<()> {
    match command {
        Commands::Hosts { query } => list_hosts(registry, query.as_deref().unwrap_or(""), json),
        Commands::Ls { uri } => {
            let (conn, uri) = open(registry, uri)?;
            let entries = conn.list_directory(&uri.path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!("{}", format_entry(entry));
                }
            }
            Ok(())
        }
        Commands::Stat { uri } => {
            let (conn, uri) = open(registry, uri)?;
            let entry = conn.stat(&uri.path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("{}", format_entry(&entry));
            }
            Ok(())
        }
        Commands::Get { uri, dest } => {
            let (conn, uri) = open(registry, uri)?;
            let dest = dest
                .clone()
                .unwrap_or_else(|| PathBuf::from(path::basename(&uri.path)));
            let progress: ProgressCallback = Arc::new(print_progress);
            conn.set_progress_callback(Some(progress));
            let data = conn.read_file(&uri.path)?;
            fs::write(&dest, &data).with_context(|| format!("Failed to write {:?}", dest))?;
            println!("{} -> {} ({} bytes)", uri, dest.display(), data.len());
            Ok(())
        }
        Commands::Put { src, uri } => {
            let (conn, uri) = open(registry, uri)?;
            let data = fs::read(src).with_context(|| format!("Failed to read {:?}", src))?;
            let progress: ProgressCallback = Arc::new(print_progress);
            conn.set_progress_callback(Some(progress));
            conn.write_file(&uri.path, &data)?;
            println!("{} -> {} ({} bytes)", src.display(), uri, data.len());
            Ok(())
        }
        Commands::Rm { uri } => {
            let (conn, uri) = open(registry, uri)?;
            conn.delete_file(&uri.path)?;
            Ok(())
        }
        Commands::Rmdir { uri } => {
            let (conn, uri) = open(registry, uri)?;
            conn.delete_directory(&uri.path)?;
            Ok(())
        }
        Commands::Mkdir { uri } => {
            let (conn, uri) = open(registry, uri)?;
            conn.create_directory(&uri.path)?;
            Ok(())
        }
        Commands::Mv { uri, new_path } => {
            let (conn, uri) = open(registry, uri)?;
            if !new_path.starts_with('/') {
                bail!("Destination must be an absolute path on {}", uri.hostname);
            }
            conn.rename(&uri.path, new_path)?;
            Ok(())
        }
    }
}

fn open(registry: &HostRegistry, uri: &str) -> Result<(Arc<RemoteConnection>, RemoteUri)> {
    let uri: RemoteUri = uri.parse()?;
    let config = registry.resolve(&uri.hostname);
    let manager = ConnectionManager::instance()?;
    let conn = manager
        .get_connection(&uri.hostname, &config)
        .with_context(|| format!("Failed to connect to {}", config.display_target()))?;
    Ok((conn, uri))
}

fn list_hosts(registry: &HostRegistry, query: &str, json: bool) -> Result<()> {
    let hosts = registry.filter(query);
    let groups = registry.groups();
    if json {
        let listing = serde_json::json!({ "groups": groups, "hosts": hosts });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if !groups.is_empty() {
        println!("Groups: {}", groups.join(", "));
    }
    for host in hosts {
        println!(
            "{:<20} {:<32} {}",
            host.alias,
            host.display_target(),
            host.group.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn format_entry(entry: &RemoteEntry) -> String {
    let mtime = Local
        .timestamp_opt(entry.mtime, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {:>12} {} {}",
        entry.permissions_string(),
        entry.size,
        mtime,
        entry.name
    )
}

fn print_progress(done: u64, total: u64) {
    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "\r{} / {} bytes", done, total);
    if done >= total {
        let _ = writeln!(stderr);
    }
}
