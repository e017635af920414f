use serde::{Deserialize, Serialize};

/// Metadata for one remote file or directory, parsed from an `ls -l` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    /// Modification time as a Unix timestamp (seconds).
    pub mtime: i64,
    /// Permission bits (`rwxrwxrwx`), without the file-type bits.
    pub mode: u32,
    pub is_dir: bool,
    pub is_file: bool,
    pub is_symlink: bool,
}

impl RemoteEntry {
    /// `/` has no parent to list, so its metadata is synthesised.
    pub fn root() -> Self {
        Self {
            name: "/".to_string(),
            size: 4096,
            mtime: 0,
            mode: 0o755,
            is_dir: true,
            is_file: false,
            is_symlink: false,
        }
    }

    /// `ls`-style rendering of type and permission bits, e.g. `drwxr-xr-x`.
    pub fn permissions_string(&self) -> String {
        let kind = if self.is_dir {
            'd'
        } else if self.is_symlink {
            'l'
        } else if self.is_file {
            '-'
        } else {
            '?'
        };

        let mut out = String::with_capacity(10);
        out.push(kind);
        for shift in (0..9).rev() {
            let set = self.mode & (1 << shift) != 0;
            out.push(match (set, shift % 3) {
                (false, _) => '-',
                (true, 2) => 'r',
                (true, 1) => 'w',
                (true, _) => 'x',
            });
        }
        out
    }
}

/// Successful payloads held by the result cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CachedData {
    Listing(Vec<RemoteEntry>),
    Entry(RemoteEntry),
}
