use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::HostConfig;

/// Result cache tuning (`[cache]` in `config.toml`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSettings {
    /// Lifetime of successful listings and stat results.
    pub ttl_secs: u64,
    /// Lifetime of cached failures (not found, permission denied).
    pub error_ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            error_ttl_secs: 300,
            max_entries: 1000,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn error_ttl(&self) -> Duration {
        Duration::from_secs(self.error_ttl_secs)
    }
}

/// Connection pool tuning (`[connection]` in `config.toml`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Limit for metadata commands. File transfers are never limited.
    pub command_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub idle_timeout_secs: u64,
    /// Where control-master sockets are created. Defaults to
    /// `~/.tfm-remote/ssh_sockets`.
    pub socket_dir: Option<PathBuf>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
            health_check_interval_secs: 60,
            idle_timeout_secs: 300,
            socket_dir: None,
        }
    }
}

impl ConnectionSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(|| {
            // Not the platform data dir: on macOS it contains a space.
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".tfm-remote")
                .join("ssh_sockets")
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub ssh_file_config: String,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostGroup {
    pub name: String,
    pub description: Option<String>,
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct HostsConfig {
    pub groups: Vec<HostGroup>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let ssh_config_path = dirs::home_dir()
            .unwrap_or_default()
            .join(".ssh")
            .join("config");
        Self {
            ssh_file_config: ssh_config_path.to_string_lossy().into_owned(),
            log_dir: None,
            cache: CacheSettings::default(),
            connection: ConnectionSettings::default(),
        }
    }
}

#[derive(Debug)]
pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
    hosts_file: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("tfm-remote");
        Self::with_dir(config_dir)
    }

    /// Use an explicit configuration directory instead of the platform one.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Result<Self> {
        let config_dir = config_dir.into();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        }

        let config_file = config_dir.join("config.toml");
        let hosts_file = config_dir.join("hosts.toml");

        Ok(Self {
            config_dir,
            config_file,
            hosts_file,
        })
    }

    pub fn load_config(&self) -> Result<AppConfig> {
        // If config file doesn't exist, create it with default values
        if !self.config_file.exists() {
            let default_config = AppConfig::default();
            self.save_config(&default_config)?;
        }

        let content: String =
            fs::read_to_string(&self.config_file).context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let toml = toml::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.config_file, toml).context("Failed to write config file")?;
        Ok(())
    }

    /// Hosts declared in `hosts.toml`, each tagged with its group name.
    pub fn load_hosts(&self) -> Result<Vec<HostConfig>> {
        if !self.hosts_file.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.hosts_file).context("Failed to read hosts file")?;

        let config: HostsConfig =
            toml::from_str(&content).context("Failed to parse hosts file")?;

        // Flatten groups into a single vector of hosts
        let mut hosts = Vec::new();
        for group in config.groups {
            for mut host in group.hosts {
                host.group = Some(group.name.clone());
                hosts.push(host);
            }
        }

        Ok(hosts)
    }

    /// Directory for log files: the configured one, or `<config dir>/logs`.
    pub fn log_dir(&self, config: &AppConfig) -> PathBuf {
        config
            .log_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config_dir.join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();

        let config = manager.load_config().unwrap();
        assert!(dir.path().join("config.toml").exists());
        assert_eq!(config.cache, CacheSettings::default());
        assert_eq!(config.connection.health_check_interval(), Duration::from_secs(60));
        assert_eq!(manager.log_dir(&config), dir.path().join("logs"));
    }

    #[test]
    fn default_socket_dir_is_under_home() {
        let socket_dir = ConnectionSettings::default().socket_dir();
        assert!(socket_dir.ends_with(".tfm-remote/ssh_sockets"));

        let explicit = ConnectionSettings {
            socket_dir: Some(PathBuf::from("/run/tfm")),
            ..ConnectionSettings::default()
        };
        assert_eq!(explicit.socket_dir(), PathBuf::from("/run/tfm"));
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "ssh_file_config = \"/dev/null\"\n[cache]\nttl_secs = 5\n",
        )
        .unwrap();

        let config = ConfigManager::with_dir(dir.path())
            .unwrap()
            .load_config()
            .unwrap();
        assert_eq!(config.cache.ttl(), Duration::from_secs(5));
        assert_eq!(config.cache.error_ttl(), Duration::from_secs(300));
        assert_eq!(config.connection.idle_timeout_secs, 300);
    }

    #[test]
    fn hosts_are_tagged_with_group() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("hosts.toml"),
            r#"
[[groups]]
name = "work"

[[groups.hosts]]
alias = "build"
hostname = "build.internal"
user = "ci"
port = 2222
"#,
        )
        .unwrap();

        let hosts = ConfigManager::with_dir(dir.path())
            .unwrap()
            .load_hosts()
            .unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].alias, "build");
        assert_eq!(hosts[0].port, Some(2222));
        assert_eq!(hosts[0].group.as_deref(), Some("work"));
    }
}
