use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::models::HostConfig;

/// Read `~/.ssh/config` style file. A missing file yields no hosts.
pub fn load_ssh_config(path: &Path) -> Result<Vec<HostConfig>> {
    if !path.exists() {
        tracing::warn!("System SSH config file not found at {:?}", path);
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context("Failed to read SSH config file")?;
    let hosts = parse_ssh_config(&content);
    tracing::info!("Loaded {} hosts from SSH config", hosts.len());
    Ok(hosts)
}

/// Split a config line into keyword and argument. Both `Key value` and
/// `Key=value` forms are accepted.
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let key = &line[..idx];
    let value = line[idx..]
        .trim_start()
        .strip_prefix('=')
        .unwrap_or_else(|| line[idx..].trim_start())
        .trim();
    if key.is_empty() || value.is_empty() {
        None
    } else {
        Some((key, value.trim_matches('"')))
    }
}

/// Parse ssh config text into one [`HostConfig`] per concrete `Host` alias.
///
/// Wildcard and negated patterns (`*`, `?`, `!`) are skipped since they
/// cannot be connected to by name. A `Match` block ends the current host.
pub fn parse_ssh_config(content: &str) -> Vec<HostConfig> {
    let mut hosts: Vec<HostConfig> = Vec::new();
    // Indices into `hosts` that the current block applies to.
    let mut current: Vec<usize> = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = split_directive(line) else {
            continue;
        };

        match key.to_ascii_lowercase().as_str() {
            "host" => {
                current.clear();
                for alias in value.split_whitespace() {
                    if alias.contains(&['*', '?', '!'][..]) {
                        continue;
                    }
                    if hosts.iter().any(|h| h.alias == alias) {
                        tracing::warn!("Duplicate Host '{}' in SSH config", alias);
                        continue;
                    }
                    current.push(hosts.len());
                    hosts.push(HostConfig::bare(alias));
                }
            }
            "match" => current.clear(),
            _ => {
                for &idx in &current {
                    hosts[idx].apply_option(key, value);
                }
            }
        }
    }

    hosts
}
