//! POSIX path helpers for remote paths.
//!
//! Remote paths are plain strings: they never touch the local filesystem,
//! so `std::path` (which follows the local platform's rules) is not used.

use std::fmt;
use std::str::FromStr;

use super::error::RemoteError;

const SSH_SCHEME: &str = "ssh://";

/// Lexically normalise a path: collapse duplicate slashes, drop `.`
/// segments, resolve `..` and strip the trailing slash.
///
/// `"/home/u/./././x/"` becomes `"/home/u/x"`, `""` becomes `"."`.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Parent directory of a normalised path. The parent of a top-level entry is
/// `/`; the parent of a bare relative name is `.`.
pub fn parent(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
        None => ".".to_string(),
    }
}

pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// True when `candidate` lies strictly beneath `ancestor`.
pub fn is_descendant(candidate: &str, ancestor: &str) -> bool {
    let prefix = format!("{}/", ancestor.trim_end_matches('/'));
    candidate.starts_with(&prefix)
}

/// Wrap a path in double quotes for an `sftp` batch command. Embedded
/// backslashes and double quotes are escaped so names with spaces,
/// brackets or quotes survive tokenisation.
pub fn quote_path(path: &str) -> String {
    let mut quoted = String::with_capacity(path.len() + 2);
    quoted.push('"');
    for ch in path.chars() {
        if ch == '"' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Inverse of [`quote_path`].
pub fn unquote_path(quoted: &str) -> String {
    let inner = quoted
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(quoted);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// `ssh://<host>/<path>` as used by the file panes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteUri {
    pub hostname: String,
    pub path: String,
}

impl RemoteUri {
    pub fn new(hostname: impl Into<String>, path: &str) -> Self {
        Self {
            hostname: hostname.into(),
            path: normalize(path),
        }
    }
}

impl FromStr for RemoteUri {
    type Err = RemoteError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let remainder = uri
            .strip_prefix(SSH_SCHEME)
            .ok_or_else(|| RemoteError::Operation(format!("Invalid SSH URI: {}", uri)))?;

        let (hostname, path) = match remainder.split_once('/') {
            Some((host, path)) => (host, format!("/{}", path)),
            None => (remainder, "/".to_string()),
        };

        if hostname.is_empty() {
            return Err(RemoteError::Operation(format!(
                "Invalid SSH URI: missing hostname in {}",
                uri
            )));
        }

        Ok(RemoteUri::new(hostname, &path))
    }
}

impl fmt::Display for RemoteUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", SSH_SCHEME, self.hostname, self.path)
    }
}
