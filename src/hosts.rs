use anyhow::{Context, Result};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use crate::config::ConfigManager;
use crate::models::HostConfig;
use crate::ssh_config;

/// Every host the user can open a remote pane on: `hosts.toml` entries first,
/// then `~/.ssh/config`. Aliases are unique.
#[derive(Debug, Default, Clone)]
pub struct HostRegistry {
    hosts: Vec<HostConfig>,
}

impl HostRegistry {
    pub fn from_hosts(hosts: Vec<HostConfig>) -> Self {
        let mut registry = Self { hosts };
        registry.handle_duplicate_hosts();
        registry
    }

    pub fn load(config_manager: &ConfigManager, ssh_config_path: &Path) -> Result<Self> {
        let mut hosts = match config_manager.load_hosts() {
            Ok(hosts) => hosts,
            Err(e) => {
                // Broken hosts.toml must not hide the ssh config hosts.
                tracing::error!("Failed to load custom hosts: {}", e);
                Vec::new()
            }
        };

        let system_hosts =
            ssh_config::load_ssh_config(ssh_config_path).context("Failed to load SSH config")?;
        hosts.extend(system_hosts);

        let registry = Self::from_hosts(hosts);
        tracing::info!("Loaded {} hosts in total", registry.hosts.len());
        Ok(registry)
    }

    fn handle_duplicate_hosts(&mut self) {
        let mut seen_aliases = HashSet::new();
        self.hosts.retain(|host| {
            if seen_aliases.insert(host.alias.clone()) {
                true
            } else {
                tracing::warn!("Duplicate alias found: {}", host.alias);
                false
            }
        });
    }

    pub fn hosts(&self) -> &[HostConfig] {
        &self.hosts
    }

    pub fn find(&self, alias: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.alias == alias)
    }

    /// Config for `alias`, or a bare entry that leaves resolution to `ssh`.
    pub fn resolve(&self, alias: &str) -> HostConfig {
        self.find(alias)
            .cloned()
            .unwrap_or_else(|| HostConfig::bare(alias))
    }

    /// Sorted, de-duplicated group names from `hosts.toml`.
    pub fn groups(&self) -> Vec<String> {
        self.hosts
            .iter()
            .filter_map(|host| host.group.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Fuzzy search over alias, hostname and user, best match first.
    /// An empty query returns every host in registry order.
    pub fn filter(&self, query: &str) -> Vec<&HostConfig> {
        if query.is_empty() {
            return self.hosts.iter().collect();
        }

        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, &HostConfig)> = self
            .hosts
            .iter()
            .filter_map(|host| {
                let fields = [
                    Some(host.alias.as_str()),
                    host.hostname.as_deref(),
                    host.user.as_deref(),
                ];
                fields
                    .into_iter()
                    .flatten()
                    .filter_map(|field| matcher.fuzzy_match(field, query))
                    .max()
                    .map(|score| (score, host))
            })
            .collect();

        // Stable sort keeps registry order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().map(|(_, host)| host).collect()
    }
}
