use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection parameters for one remote host.
///
/// `alias` is the name handed to `ssh`/`sftp` (usually a `Host` entry of
/// `~/.ssh/config`); the remaining fields override what that entry says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub alias: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

impl HostConfig {
    /// A host known only by name; `ssh` resolves everything else.
    pub fn bare(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            hostname: None,
            user: None,
            port: None,
            identity_file: None,
            description: None,
            group: None,
        }
    }

    /// Build from an ssh-config style key/value map (`HostName`, `User`,
    /// `Port`, `IdentityFile`). Keys are matched case-insensitively and
    /// unknown keys are ignored.
    pub fn from_map(alias: impl Into<String>, map: &HashMap<String, String>) -> Self {
        let mut host = Self::bare(alias);
        for (key, value) in map {
            host.apply_option(key, value);
        }
        host
    }

    /// Apply one `Key value` pair. Returns false for keys this type does not
    /// track.
    pub fn apply_option(&mut self, key: &str, value: &str) -> bool {
        let value = value.trim();
        match key.to_ascii_lowercase().as_str() {
            "hostname" => self.hostname = Some(value.to_string()),
            "user" => self.user = Some(value.to_string()),
            "port" => match value.parse::<u16>() {
                Ok(port) => self.port = Some(port),
                Err(_) => {
                    tracing::warn!("Ignoring invalid port '{}' for host {}", value, self.alias);
                }
            },
            "identityfile" => self.identity_file = Some(expand_tilde(value)),
            _ => return false,
        }
        true
    }

    /// Address actually dialled.
    pub fn target(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.alias)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// `user@host:port` for display.
    pub fn display_target(&self) -> String {
        let mut out = String::new();
        if let Some(user) = &self.user {
            out.push_str(user);
            out.push('@');
        }
        out.push_str(self.target());
        if self.port() != DEFAULT_SSH_PORT {
            out.push_str(&format!(":{}", self.port()));
        }
        out
    }
}

fn expand_tilde(value: &str) -> String {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest).to_string_lossy().into_owned())
            .unwrap_or_else(|| value.to_string()),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_map_is_case_insensitive() {
        let map: HashMap<String, String> = [
            ("HostName", "10.0.0.5"),
            ("user", "deploy"),
            ("PORT", "2200"),
            ("ForwardAgent", "yes"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let host = HostConfig::from_map("staging", &map);
        assert_eq!(host.target(), "10.0.0.5");
        assert_eq!(host.user.as_deref(), Some("deploy"));
        assert_eq!(host.port(), 2200);
        assert_eq!(host.display_target(), "deploy@10.0.0.5:2200");
    }

    #[test]
    fn bare_host_targets_alias() {
        let host = HostConfig::bare("nas");
        assert_eq!(host.target(), "nas");
        assert_eq!(host.port(), DEFAULT_SSH_PORT);
        assert_eq!(host.display_target(), "nas");
    }

    #[test]
    fn invalid_port_is_ignored() {
        let mut host = HostConfig::bare("x");
        assert!(host.apply_option("Port", "ssh"));
        assert_eq!(host.port, None);
        assert!(!host.apply_option("Compression", "yes"));
    }
}
