//! One host's multiplexed SSH connection and the file operations on top of it.
//!
//! A control master (`ssh -N -o ControlMaster=yes`) is started once; every
//! operation afterwards is a short `sftp -b -` session that reuses its socket.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use super::cache::{CacheOperation, ResultCache};
use super::error::{
    classify_stderr, ErrorPattern, RemoteError, CONNECT_ERRORS, PATH_ERRORS, WRITE_ERRORS,
};
use super::listing;
use super::path::{self, quote_path};
use super::runner::{CommandOutput, CommandRunner, RunError};
use super::types::{CachedData, RemoteEntry};
use crate::config::ConnectionSettings;
use crate::models::{HostConfig, DEFAULT_SSH_PORT};

/// `(bytes_transferred, total_bytes)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const MASTER_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Transfers at or below this size report no progress.
const PROGRESS_THRESHOLD: u64 = 1024 * 1024;
const CONTROL_PERSIST: &str = "ControlPersist=10m";
const PWD_PREFIX: &str = "Remote working directory:";

#[derive(Debug, Default)]
struct ConnectionState {
    connected: bool,
    default_directory: Option<String>,
    last_master_check: Option<Instant>,
    cached_master_status: bool,
}

pub struct RemoteConnection {
    hostname: String,
    config: HostConfig,
    control_path: PathBuf,
    command_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    cache: Arc<ResultCache>,
    state: Mutex<ConnectionState>,
    progress: Mutex<Option<ProgressCallback>>,
}

impl fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("hostname", &self.hostname)
            .field("target", &self.config.display_target())
            .field("control_path", &self.control_path)
            .field("connected", &self.connected_flag())
            .finish_non_exhaustive()
    }
}

impl RemoteConnection {
    pub fn new(
        hostname: impl Into<String>,
        config: &HostConfig,
        settings: &ConnectionSettings,
        runner: Arc<dyn CommandRunner>,
        cache: Arc<ResultCache>,
    ) -> Self {
        let hostname = hostname.into();
        // Short hash keeps the socket path under the unix socket length limit;
        // the pid keeps two file manager processes from sharing a master.
        let digest = hex::encode(Sha256::digest(hostname.as_bytes()));
        let control_path = settings
            .socket_dir()
            .join(format!("tfm-ssh-{}-{}", &digest[..8], std::process::id()));

        Self {
            hostname,
            config: config.clone(),
            control_path,
            command_timeout: settings.command_timeout(),
            runner,
            cache,
            state: Mutex::new(ConnectionState::default()),
            progress: Mutex::new(None),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn control_path(&self) -> &std::path::Path {
        &self.control_path
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Working directory reported by the server at connect time.
    pub fn default_directory(&self) -> Option<String> {
        self.lock_state().default_directory.clone()
    }

    /// Last known state, without touching the network.
    pub fn connected_flag(&self) -> bool {
        self.lock_state().connected
    }

    pub fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    fn progress_for(&self, size: u64) -> Option<ProgressCallback> {
        if size <= PROGRESS_THRESHOLD {
            return None;
        }
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Options shared by `ssh` and `sftp`. The two disagree on the port flag.
    fn host_options(&self, port_flag: &str) -> Vec<String> {
        let mut args = Vec::new();

        if self.config.port() != DEFAULT_SSH_PORT {
            args.push(port_flag.to_string());
            args.push(self.config.port().to_string());
        }
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        if let Some(user) = &self.config.user {
            args.push("-o".to_string());
            args.push(format!("User={}", user));
        }
        if let Some(target) = self.config.hostname.as_deref().filter(|h| *h != self.hostname) {
            args.push("-o".to_string());
            args.push(format!("HostName={}", target));
        }

        args.extend(
            ["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(self.hostname.clone());
        args
    }

    /// Quoted so ssh keeps a socket dir containing spaces as one value.
    fn control_path_option(&self) -> String {
        format!("ControlPath=\"{}\"", self.control_path.display())
    }

    /// `ssh -O <command>` against the running master.
    fn control_command(&self, command: &str) -> Result<CommandOutput, RunError> {
        let args = vec![
            "-O".to_string(),
            command.to_string(),
            "-o".to_string(),
            self.control_path_option(),
            self.hostname.clone(),
        ];
        self.runner
            .run("ssh", &args, None, Some(CONTROL_COMMAND_TIMEOUT))
    }

    fn check_control_master(&self) -> bool {
        match self.control_command("check") {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("Control master check for {} failed: {}", self.hostname, e);
                false
            }
        }
    }

    fn establish_control_master(&self) -> Result<(), RemoteError> {
        if let Some(dir) = self.control_path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| RemoteError::io("Failed to create SSH socket directory", e))?;
        }

        let mut args = vec![
            "-N".to_string(),
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            self.control_path_option(),
            "-o".to_string(),
            CONTROL_PERSIST.to_string(),
        ];
        args.extend(self.host_options("-p"));

        match self.runner.run("ssh", &args, None, Some(CONNECT_TIMEOUT)) {
            Ok(output) if output.success() && self.control_path.exists() => Ok(()),
            Ok(output) => {
                error!("SSH process exited with code {}", output.status);
                for line in output.stderr.lines().take(50) {
                    error!("  stderr: {}", line);
                }
                Err(classify_stderr(
                    &output.stderr,
                    CONNECT_ERRORS,
                    "establish control master for",
                    &self.hostname,
                ))
            }
            // The master may still be in the foreground when the limit hits;
            // a socket on disk means it is up.
            Err(RunError::TimedOut(_)) if self.control_path.exists() => Ok(()),
            Err(RunError::TimedOut(_)) => {
                error!("Control socket not created after {}s", CONNECT_TIMEOUT.as_secs());
                Err(RemoteError::ConnectionTimeout(format!(
                    "Timeout establishing control master for {}",
                    self.hostname
                )))
            }
            Err(RunError::Io(e)) => Err(RemoteError::io(
                &format!("Failed to establish control master for {}", self.hostname),
                e,
            )),
        }
    }

    /// Start the control master and record the remote working directory.
    /// A no-op when a live master already exists.
    pub fn connect(&self) -> Result<(), RemoteError> {
        let mut state = self.lock_state();
        if state.connected && self.check_control_master() {
            return Ok(());
        }

        self.establish_control_master().map_err(|e| {
            error!("Failed to connect to {}: {}", self.hostname, e);
            e
        })?;

        let output = self.execute_sftp_command(&["pwd".to_string()], Some(CONNECT_TIMEOUT))?;
        if !output.success() {
            let err = classify_stderr(&output.stderr, CONNECT_ERRORS, "connect to", &self.hostname);
            error!("{}", err);
            debug!("Detailed error: {}", output.stderr.trim());
            return Err(err);
        }

        let directory = output
            .stdout
            .lines()
            .find_map(|line| line.trim().strip_prefix(PWD_PREFIX))
            .map(|dir| dir.trim().to_string())
            .filter(|dir| !dir.is_empty())
            .unwrap_or_else(|| "/".to_string());

        info!("Connected to {}, default directory: {}", self.hostname, directory);
        state.connected = true;
        state.default_directory = Some(directory);
        Ok(())
    }

    /// Tear down the control master. Never fails; problems are logged.
    pub fn disconnect(&self) {
        let mut state = self.lock_state();
        if !state.connected {
            return;
        }

        match self.control_command("exit") {
            Ok(output) if !output.success() => {
                warn!("Closing control master for {}: {}", self.hostname, output.stderr.trim())
            }
            Ok(_) => {}
            Err(e) => error!("Error closing control master for {}: {}", self.hostname, e),
        }

        state.connected = false;
        state.cached_master_status = false;
        state.last_master_check = None;
        drop(state);

        self.cache.invalidate_hostname(&self.hostname);
        info!("Disconnected from {}", self.hostname);
    }

    /// Verify the control master is alive. The real check runs at most once
    /// per five seconds; in between the last answer is returned.
    pub fn is_connected(&self) -> bool {
        let mut state = self.lock_state();
        if !state.connected {
            return false;
        }

        let now = Instant::now();
        if let Some(last) = state.last_master_check {
            if now.duration_since(last) < MASTER_CHECK_INTERVAL {
                return state.cached_master_status;
            }
        }

        let status = self.check_control_master();
        state.cached_master_status = status;
        state.last_master_check = Some(now);
        if !status {
            warn!("Control master for {} is gone", self.hostname);
            state.connected = false;
        }
        status
    }

    fn ensure_connected(&self) -> Result<(), RemoteError> {
        if self.connected_flag() {
            Ok(())
        } else {
            Err(RemoteError::ConnectionLost(format!(
                "Not connected to {}",
                self.hostname
            )))
        }
    }

    /// Feed `commands` to a batch `sftp` session over the control master.
    /// `timeout: None` waits as long as the transfer takes.
    pub(crate) fn execute_sftp_command(
        &self,
        commands: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, RemoteError> {
        let mut args = vec![
            "-b".to_string(),
            "-".to_string(),
            "-o".to_string(),
            self.control_path_option(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
        ];
        args.extend(self.host_options("-P"));

        let mut input = commands.join("\n");
        input.push('\n');

        self.runner
            .run("sftp", &args, Some(&input), timeout)
            .map_err(|e| {
                let err = match e {
                    RunError::TimedOut(limit) => RemoteError::ConnectionTimeout(format!(
                        "SFTP command timeout after {}s for {}",
                        limit.as_secs(),
                        self.hostname
                    )),
                    RunError::Io(e) => RemoteError::io(
                        &format!("SFTP command execution error for {}", self.hostname),
                        e,
                    ),
                };
                error!("{}", err);
                err
            })
    }

    /// Run one command and classify a non-zero exit.
    fn run_checked(
        &self,
        command: String,
        timeout: Option<Duration>,
        table: &[ErrorPattern],
        action: &str,
        subject: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let output = self.execute_sftp_command(&[command], timeout)?;
        if output.success() {
            return Ok(output);
        }

        let err = classify_stderr(&output.stderr, table, action, subject);
        error!("{}", err);
        debug!("Detailed error: {}", output.stderr.trim());
        Err(err)
    }

    fn fetch_listing(&self, dir: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let output = self.run_checked(
            format!("ls -la {}", quote_path(dir)),
            Some(self.command_timeout),
            PATH_ERRORS,
            "list directory",
            dir,
        )?;
        Ok(listing::parse_listing(&output.stdout))
    }

    fn cache_error(&self, operation: CacheOperation, path: &str, err: &RemoteError) {
        if err.is_cacheable() {
            self.cache.put_error(operation, &self.hostname, path, err, None, &[]);
        }
    }

    /// Directory contents without `.` and `..`.
    ///
    /// A successful listing also caches a `stat` result for every child, so
    /// the per-file lookups a file pane does right after are free.
    pub fn list_directory(&self, remote_path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.ensure_connected()?;
        let dir = path::normalize(remote_path);

        match self.cache.get(CacheOperation::ListDirectory, &self.hostname, &dir, &[]) {
            Some(Ok(CachedData::Listing(entries))) => return Ok(entries),
            Some(Err(err)) => return Err(err),
            _ => {}
        }

        let entries = self.fetch_listing(&dir).map_err(|err| {
            self.cache_error(CacheOperation::ListDirectory, &dir, &err);
            err
        })?;

        for entry in &entries {
            let child = path::normalize(&path::join(&dir, &entry.name));
            self.cache.put_data(
                CacheOperation::Stat,
                &self.hostname,
                &child,
                CachedData::Entry(entry.clone()),
                None,
                &[],
            );
        }
        self.cache.put_data(
            CacheOperation::ListDirectory,
            &self.hostname,
            &dir,
            CachedData::Listing(entries.clone()),
            None,
            &[],
        );

        debug!("Listed {} entries in {}:{}", entries.len(), self.hostname, dir);
        Ok(entries)
    }

    /// Metadata for one path.
    ///
    /// `ls -l` on a file prints that file; on a directory it prints the
    /// children. A directory's own entry is therefore taken from its
    /// parent's listing.
    pub fn stat(&self, remote_path: &str) -> Result<RemoteEntry, RemoteError> {
        self.ensure_connected()?;
        let target = path::normalize(remote_path);

        match self.cache.get(CacheOperation::Stat, &self.hostname, &target, &[]) {
            Some(Ok(CachedData::Entry(entry))) => {
                debug!("stat() cache hit for {}", target);
                return Ok(entry);
            }
            Some(Err(err)) => return Err(err),
            _ => debug!("stat() cache miss for {}, fetching from remote", target),
        }

        if target == "/" {
            let root = RemoteEntry::root();
            self.put_stat(&target, &root);
            return Ok(root);
        }

        let output = self
            .run_checked(
                format!("ls -l {}", quote_path(&target)),
                Some(self.command_timeout),
                PATH_ERRORS,
                "stat path",
                &target,
            )
            .map_err(|err| {
                self.cache_error(CacheOperation::Stat, &target, &err);
                err
            })?;

        let lines: Vec<&str> = listing::entry_lines(&output.stdout).collect();
        if let [line] = lines.as_slice() {
            // A directory with exactly one child also prints a single line;
            // that line names the child, not the directory.
            let names_child = listing::raw_name(line)
                .is_some_and(|name| path::is_descendant(&path::normalize(name), &target));
            if !names_child {
                if let Some(entry) = listing::parse_ls_line(line) {
                    self.put_stat(&target, &entry);
                    return Ok(entry);
                }
            }
        }

        let name = path::basename(&target);
        match self.fetch_listing(&path::parent(&target)) {
            Ok(siblings) => {
                if let Some(entry) = siblings.into_iter().find(|e| e.name == name) {
                    self.put_stat(&target, &entry);
                    return Ok(entry);
                }
            }
            Err(err) => debug!("Parent listing for {} failed: {}", target, err),
        }

        let err = RemoteError::Operation(format!("Failed to parse stat output for {}", target));
        error!("{}", err);
        Err(err)
    }

    fn put_stat(&self, path: &str, entry: &RemoteEntry) {
        self.cache.put_data(
            CacheOperation::Stat,
            &self.hostname,
            path,
            CachedData::Entry(entry.clone()),
            None,
            &[],
        );
    }

    pub fn exists(&self, remote_path: &str) -> Result<bool, RemoteError> {
        match self.stat(remote_path) {
            Ok(_) => Ok(true),
            Err(RemoteError::PathNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Download a whole file into memory.
    pub fn read_file(&self, remote_path: &str) -> Result<Vec<u8>, RemoteError> {
        self.ensure_connected()?;
        let source = path::normalize(remote_path);

        let size = match self.stat(&source) {
            Ok(entry) => entry.size,
            Err(err @ (RemoteError::PathNotFound(_) | RemoteError::PermissionDenied(_))) => {
                return Err(err)
            }
            Err(err) => {
                debug!("Size of {} unknown before download: {}", source, err);
                0
            }
        };

        let tmp = NamedTempFile::new()
            .map_err(|e| RemoteError::io("Failed to create temporary file", e))?;
        let local = tmp.path().to_string_lossy().into_owned();

        let progress = self.progress_for(size);
        if let Some(callback) = &progress {
            callback(0, size);
        }

        self.run_checked(
            format!("get {} {}", quote_path(&source), quote_path(&local)),
            None,
            PATH_ERRORS,
            "read file",
            &source,
        )?;

        if let Some(callback) = &progress {
            callback(size, size);
        }

        let data = fs::read(tmp.path()).map_err(|e| {
            RemoteError::io(&format!("Failed to read downloaded copy of {}", source), e)
        })?;
        info!("Read {} bytes from {}:{}", data.len(), self.hostname, source);
        Ok(data)
    }

    /// Upload `data`, replacing the remote file.
    pub fn write_file(&self, remote_path: &str, data: &[u8]) -> Result<(), RemoteError> {
        self.ensure_connected()?;
        let destination = path::normalize(remote_path);

        let mut tmp = NamedTempFile::new()
            .map_err(|e| RemoteError::io("Failed to create temporary file", e))?;
        tmp.write_all(data)
            .and_then(|_| tmp.flush())
            .map_err(|e| RemoteError::io("Failed to write temporary file", e))?;
        let local = tmp.path().to_string_lossy().into_owned();

        let size = data.len() as u64;
        let progress = self.progress_for(size);
        if let Some(callback) = &progress {
            callback(0, size);
        }

        self.run_checked(
            format!("put {} {}", quote_path(&local), quote_path(&destination)),
            None,
            WRITE_ERRORS,
            "write file",
            &destination,
        )?;

        if let Some(callback) = &progress {
            callback(size, size);
        }

        self.cache.invalidate_path(&self.hostname, &destination);
        info!("Wrote {} bytes to {}:{}", size, self.hostname, destination);
        Ok(())
    }

    pub fn delete_file(&self, remote_path: &str) -> Result<(), RemoteError> {
        self.ensure_connected()?;
        let target = path::normalize(remote_path);

        self.run_checked(
            format!("rm {}", quote_path(&target)),
            Some(self.command_timeout),
            PATH_ERRORS,
            "delete file",
            &target,
        )?;

        self.cache.invalidate_path(&self.hostname, &target);
        info!("Deleted {}:{}", self.hostname, target);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn delete_directory(&self, remote_path: &str) -> Result<(), RemoteError> {
        self.ensure_connected()?;
        let target = path::normalize(remote_path);

        self.run_checked(
            format!("rmdir {}", quote_path(&target)),
            Some(self.command_timeout),
            PATH_ERRORS,
            "delete directory",
            &target,
        )?;

        self.cache.invalidate_directory(&self.hostname, &target);
        self.cache.invalidate_path(&self.hostname, &target);
        info!("Deleted directory {}:{}", self.hostname, target);
        Ok(())
    }

    pub fn create_directory(&self, remote_path: &str) -> Result<(), RemoteError> {
        self.ensure_connected()?;
        let target = path::normalize(remote_path);

        self.run_checked(
            format!("mkdir {}", quote_path(&target)),
            Some(self.command_timeout),
            PATH_ERRORS,
            "create directory",
            &target,
        )?;

        self.cache.invalidate_path(&self.hostname, &target);
        info!("Created directory {}:{}", self.hostname, target);
        Ok(())
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<(), RemoteError> {
        self.ensure_connected()?;
        let from = path::normalize(old_path);
        let to = path::normalize(new_path);

        self.run_checked(
            format!("rename {} {}", quote_path(&from), quote_path(&to)),
            Some(self.command_timeout),
            PATH_ERRORS,
            "rename",
            &from,
        )?;

        self.cache.invalidate_path(&self.hostname, &from);
        self.cache.invalidate_path(&self.hostname, &to);
        info!("Renamed {}:{} to {}", self.hostname, from, to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{fail, ok, respond_default, Invocation, ScriptedRunner};
    use crate::remote::ErrorKind;
    use std::collections::HashMap;

    const HOST: &str = "box";

    const DATA_LISTING: &str = "sftp> ls -la \"/data\"\n\
        drwxr-xr-x    4 u g 4096 Jan 15 10:30 /data/.\n\
        drwxr-xr-x   20 u g 4096 Jan 15 10:30 /data/..\n\
        -rw-r--r--    1 u g   10 Jan 15 10:30 /data/a\n\
        -rw-r--r--    1 u g   20 Jan 15 10:30 /data/b\n\
        drwxr-xr-x    2 u g 4096 Jan 15 10:30 /data/c\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        runner: Arc<ScriptedRunner>,
        cache: Arc<ResultCache>,
        conn: RemoteConnection,
    }

    fn fixture_with(
        config: HostConfig,
        respond: impl Fn(&Invocation) -> Result<CommandOutput, RunError> + Send + Sync + 'static,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = ConnectionSettings {
            socket_dir: Some(dir.path().to_path_buf()),
            ..ConnectionSettings::default()
        };
        let runner = ScriptedRunner::new(respond);
        let cache = Arc::new(ResultCache::default());
        let conn = RemoteConnection::new(HOST, &config, &settings, runner.clone(), cache.clone());
        Fixture {
            _dir: dir,
            runner,
            cache,
            conn,
        }
    }

    fn connected(
        respond: impl Fn(&Invocation) -> Result<CommandOutput, RunError> + Send + Sync + 'static,
    ) -> Fixture {
        let fx = fixture_with(HostConfig::bare(HOST), respond);
        fx.conn.connect().unwrap();
        fx.runner.clear();
        fx
    }

    #[test]
    fn connect_records_default_directory() {
        let config = HostConfig {
            port: Some(2222),
            identity_file: Some("/keys/id".into()),
            user: Some("deploy".into()),
            ..HostConfig::bare(HOST)
        };
        let fx = fixture_with(config, respond_default);
        fx.conn.connect().unwrap();

        assert!(fx.conn.connected_flag());
        assert_eq!(fx.conn.default_directory().as_deref(), Some("/home/u"));

        let calls = fx.runner.calls();
        let master = &calls[0];
        assert!(master.is_master());
        assert!(master.has_pair("-p", "2222"));
        assert!(master.has_pair("-i", "/keys/id"));
        assert!(master.has_pair("-o", CONTROL_PERSIST));
        assert_eq!(master.args.last().map(String::as_str), Some(HOST));

        let pwd = &calls[1];
        assert_eq!(pwd.program, "sftp");
        assert!(pwd.has_pair("-P", "2222"));
        assert!(pwd.has_pair("-o", "ControlMaster=no"));
        assert!(pwd.has_pair("-o", "User=deploy"));
        assert_eq!(pwd.sftp_commands(), vec!["pwd"]);
    }

    #[test]
    fn connect_classifies_auth_failure() {
        let fx = fixture_with(HostConfig::bare(HOST), |inv| {
            if inv.is_master() {
                Ok(CommandOutput {
                    status: 255,
                    stderr: "deploy@box: Permission denied (publickey).\n".into(),
                    ..CommandOutput::default()
                })
            } else {
                respond_default(inv)
            }
        });
        let err = fx.conn.connect().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(!fx.conn.connected_flag());
    }

    #[test]
    fn operations_require_connection() {
        let fx = fixture_with(HostConfig::bare(HOST), respond_default);
        let err = fx.conn.list_directory("/").unwrap_err();
        assert_eq!(err, RemoteError::ConnectionLost("Not connected to box".into()));
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn listing_prepopulates_child_stats() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["ls -la \"/data\""] => ok(DATA_LISTING),
            _ => respond_default(inv),
        });

        let names: Vec<_> = fx
            .conn
            .list_directory("/data/./")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(fx.runner.count(|i| i.program == "sftp"), 1);

        assert_eq!(fx.conn.stat("/data/b").unwrap().size, 20);
        assert!(fx.conn.stat("/data/c").unwrap().is_dir);
        fx.conn.list_directory("/data").unwrap();
        assert_eq!(fx.runner.count(|i| i.program == "sftp"), 1);
    }

    #[test]
    fn failed_listing_is_cached_without_stat_entries() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["ls -la \"/root\""] => fail("remote readdir(\"/root\"): Permission denied"),
            _ => respond_default(inv),
        });

        let first = fx.conn.list_directory("/root").unwrap_err();
        assert_eq!(first.kind(), ErrorKind::PermissionDenied);
        let second = fx.conn.list_directory("/root").unwrap_err();
        assert_eq!(first, second);

        assert_eq!(fx.runner.count(|i| i.program == "sftp"), 1);
        let stats = fx.cache.get_stats();
        assert_eq!(stats.operation_counts.get(&CacheOperation::Stat), None);
        assert_eq!(stats.operation_counts.get(&CacheOperation::ListDirectory), Some(&1));
    }

    #[test]
    fn transient_listing_errors_are_not_cached() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["ls -la \"/flaky\""] => fail("Couldn't read packet: Connection reset by peer"),
            _ => respond_default(inv),
        });

        assert_eq!(fx.conn.list_directory("/flaky").unwrap_err().kind(), ErrorKind::Operation);
        assert!(fx.conn.list_directory("/flaky").is_err());
        assert_eq!(fx.runner.count(|i| i.program == "sftp"), 2);
    }

    #[test]
    fn stat_of_file_uses_single_line() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["ls -l \"/data/my file.txt\""] => {
                ok("-rw-r-----    1 u g 77 Jan 15 10:30 /data/my file.txt\n")
            }
            _ => respond_default(inv),
        });

        let entry = fx.conn.stat("/data/my file.txt").unwrap();
        assert_eq!(entry.name, "my file.txt");
        assert_eq!(entry.size, 77);
        assert_eq!(entry.mode, 0o640);

        fx.conn.stat("/data/my file.txt").unwrap();
        assert_eq!(fx.runner.count(|i| i.program == "sftp"), 1);
    }

    #[test]
    fn stat_of_directory_reads_parent_listing() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            // Single child: must not be mistaken for a file.
            ["ls -l \"/data/c\""] => ok("-rw-r--r--    1 u g 5 Jan 15 10:30 /data/c/only\n"),
            ["ls -la \"/data\""] => ok(DATA_LISTING),
            _ => respond_default(inv),
        });

        let entry = fx.conn.stat("/data/c").unwrap();
        assert_eq!(entry.name, "c");
        assert!(entry.is_dir);
        assert_eq!(fx.runner.count(|i| i.program == "sftp"), 2);
    }

    #[test]
    fn stat_of_empty_directory_reads_parent_listing() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["ls -l \"/data/c\""] => ok("sftp> ls -l \"/data/c\"\n"),
            ["ls -la \"/data\""] => ok(DATA_LISTING),
            _ => respond_default(inv),
        });
        assert!(fx.conn.stat("/data/c").unwrap().is_dir);
    }

    #[test]
    fn stat_of_root_is_synthesised() {
        let fx = connected(respond_default);
        assert_eq!(fx.conn.stat("/").unwrap(), RemoteEntry::root());
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn missing_path_is_negatively_cached() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["ls -l \"/nope\""] => fail("Can't ls: \"/nope\" not found"),
            _ => respond_default(inv),
        });

        assert!(!fx.conn.exists("/nope").unwrap());
        let err = fx.conn.stat("/nope").unwrap_err();
        assert_eq!(err, RemoteError::PathNotFound("Remote path not found: /nope".into()));
        assert_eq!(fx.runner.count(|i| i.program == "sftp"), 1);
    }

    #[test]
    fn health_check_is_rate_limited() {
        let fx = connected(respond_default);

        assert!(fx.conn.is_connected());
        assert!(fx.conn.is_connected());
        assert_eq!(fx.runner.count(Invocation::is_check), 1);
    }

    #[test]
    fn failed_health_check_marks_disconnected() {
        let fx = connected(|inv| {
            if inv.is_check() {
                fail("Control socket connect: No such file or directory")
            } else {
                respond_default(inv)
            }
        });

        assert!(!fx.conn.is_connected());
        assert!(!fx.conn.connected_flag());
        assert!(!fx.conn.is_connected());
        assert_eq!(fx.runner.count(Invocation::is_check), 1);
    }

    #[test]
    fn disconnect_is_idempotent_and_clears_host_cache() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["ls -la \"/data\""] => ok(DATA_LISTING),
            _ => respond_default(inv),
        });
        fx.conn.list_directory("/data").unwrap();
        assert!(!fx.cache.is_empty());

        fx.conn.disconnect();
        fx.conn.disconnect();
        assert!(fx.cache.is_empty());
        assert_eq!(fx.runner.count(|i| i.has_pair("-O", "exit")), 1);
    }

    #[test]
    fn sftp_timeout_maps_to_connection_timeout() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["ls -la \"/slow\""] => Err(RunError::TimedOut(Duration::from_secs(30))),
            _ => respond_default(inv),
        });
        let err = fx.conn.list_directory("/slow").unwrap_err();
        assert_eq!(
            err,
            RemoteError::ConnectionTimeout("SFTP command timeout after 30s for box".into())
        );
    }

    #[test]
    fn rename_invalidates_both_paths() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["ls -la \"/data\""] => ok(DATA_LISTING),
            _ => respond_default(inv),
        });
        fx.conn.list_directory("/data").unwrap();
        fx.conn.rename("/data/a", "/data/z").unwrap();

        let renamed = fx
            .runner
            .count(|i| i.sftp_commands() == ["rename \"/data/a\" \"/data/z\""]);
        assert_eq!(renamed, 1);
        assert!(fx.cache.get(CacheOperation::Stat, HOST, "/data/a", &[]).is_none());
        assert!(fx.cache.get(CacheOperation::ListDirectory, HOST, "/data", &[]).is_none());
        assert!(fx.cache.get(CacheOperation::Stat, HOST, "/data/b", &[]).is_some());
    }

    #[test]
    fn control_path_survives_spaces_in_socket_dir() {
        let dir = tempfile::tempdir().unwrap();
        let socket_dir = dir.path().join("Application Support").join("ssh_sockets");
        let settings = ConnectionSettings {
            socket_dir: Some(socket_dir.clone()),
            ..ConnectionSettings::default()
        };
        let runner = ScriptedRunner::new(respond_default);
        let cache = Arc::new(ResultCache::default());
        let conn = RemoteConnection::new(
            HOST,
            &HostConfig::bare(HOST),
            &settings,
            runner.clone(),
            cache,
        );

        conn.connect().unwrap();
        assert!(conn.control_path().starts_with(&socket_dir));
        assert!(conn.control_path().exists());

        let expected = format!("ControlPath=\"{}\"", conn.control_path().display());
        for call in runner.calls() {
            assert!(call.has_pair("-o", &expected), "{:?}", call.args);
        }
    }

    /// Connected to a host serving [`DATA_LISTING`], with `/data` already listed.
    fn listed_data(
        respond: impl Fn(&Invocation) -> Result<CommandOutput, RunError> + Send + Sync + 'static,
    ) -> Fixture {
        let fx = connected(move |inv| match inv.sftp_commands().as_slice() {
            ["ls -la \"/data\""] => ok(DATA_LISTING),
            _ => respond(inv),
        });
        fx.conn.list_directory("/data").unwrap();
        fx
    }

    fn cached(fx: &Fixture, operation: CacheOperation, path: &str) -> bool {
        fx.cache.get(operation, HOST, path, &[]).is_some()
    }

    #[test]
    fn delete_file_invalidates_entry_and_parent_listing() {
        let fx = listed_data(respond_default);
        fx.conn.delete_file("/data/a").unwrap();

        assert_eq!(fx.runner.count(|i| i.sftp_commands() == ["rm \"/data/a\""]), 1);
        assert!(!cached(&fx, CacheOperation::Stat, "/data/a"));
        assert!(!cached(&fx, CacheOperation::ListDirectory, "/data"));
        assert!(cached(&fx, CacheOperation::Stat, "/data/b"));
    }

    #[test]
    fn delete_directory_invalidates_subtree_and_parent_listing() {
        let fx = listed_data(|inv| match inv.sftp_commands().as_slice() {
            ["ls -la \"/data/c\""] => ok("-rw-r--r--    1 u g 5 Jan 15 10:30 /data/c/only\n"),
            _ => respond_default(inv),
        });
        fx.conn.list_directory("/data/c").unwrap();
        assert!(cached(&fx, CacheOperation::Stat, "/data/c/only"));

        fx.conn.delete_directory("/data/c").unwrap();

        assert!(!cached(&fx, CacheOperation::Stat, "/data/c"));
        assert!(!cached(&fx, CacheOperation::ListDirectory, "/data/c"));
        assert!(!cached(&fx, CacheOperation::Stat, "/data/c/only"));
        assert!(!cached(&fx, CacheOperation::ListDirectory, "/data"));
        assert!(cached(&fx, CacheOperation::Stat, "/data/a"));
    }

    #[test]
    fn create_directory_invalidates_parent_listing() {
        let fx = listed_data(respond_default);
        fx.conn.create_directory("/data/new").unwrap();

        assert_eq!(fx.runner.count(|i| i.sftp_commands() == ["mkdir \"/data/new\""]), 1);
        assert!(!cached(&fx, CacheOperation::ListDirectory, "/data"));
        assert!(cached(&fx, CacheOperation::Stat, "/data/a"));
    }

    #[test]
    fn write_file_invalidates_entry_and_parent_listing() {
        let fx = listed_data(respond_default);
        fx.conn.write_file("/data/b", b"replaced").unwrap();

        assert!(!cached(&fx, CacheOperation::Stat, "/data/b"));
        assert!(!cached(&fx, CacheOperation::ListDirectory, "/data"));
        assert!(cached(&fx, CacheOperation::Stat, "/data/a"));
    }

    #[test]
    fn write_file_reports_disk_full_and_keeps_cache() {
        let fx = listed_data(|inv| {
            if inv.transfer("put").is_some() {
                return fail("Couldn't write to remote file \"/data/b\": No space left on device");
            }
            respond_default(inv)
        });

        let err = fx.conn.write_file("/data/b", b"too much").unwrap_err();
        assert_eq!(
            err,
            RemoteError::Operation("Disk full on remote system: /data/b".into())
        );
        assert!(cached(&fx, CacheOperation::Stat, "/data/b"));
        assert!(cached(&fx, CacheOperation::ListDirectory, "/data"));
    }

    #[test]
    fn delete_directory_reports_not_empty() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["rmdir \"/data/c\""] => fail("Couldn't remove directory: Directory not empty"),
            _ => respond_default(inv),
        });
        let err = fx.conn.delete_directory("/data/c").unwrap_err();
        assert_eq!(err, RemoteError::Operation("Directory not empty: /data/c".into()));
    }

    #[test]
    fn write_file_uploads_and_reports_progress() {
        let uploaded: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::default();
        let sink = uploaded.clone();
        let fx = connected(move |inv| {
            if let Some((local, remote)) = inv.transfer("put") {
                let bytes = fs::read(&local).unwrap();
                sink.lock().unwrap().insert(remote, bytes);
                return ok("");
            }
            respond_default(inv)
        });

        let events: Arc<Mutex<Vec<(u64, u64)>>> = Arc::default();
        let recorder = events.clone();
        let callback: ProgressCallback = Arc::new(move |done, total| {
            recorder.lock().unwrap().push((done, total));
        });
        fx.conn.set_progress_callback(Some(callback));

        let payload = vec![7u8; 2 * 1024 * 1024];
        fx.conn.write_file("/data/big.bin", &payload).unwrap();
        fx.conn.write_file("/data/small.txt", b"hi").unwrap();

        let uploaded = uploaded.lock().unwrap();
        assert_eq!(uploaded.get("/data/big.bin").map(Vec::len), Some(payload.len()));
        assert_eq!(uploaded.get("/data/small.txt").map(Vec::as_slice), Some(&b"hi"[..]));

        let total = payload.len() as u64;
        assert_eq!(*events.lock().unwrap(), vec![(0, total), (total, total)]);
    }

    #[test]
    fn read_file_downloads_through_temp_file() {
        let fx = connected(|inv| {
            if let Some((remote, local)) = inv.transfer("get") {
                assert_eq!(remote, "/etc/motd");
                fs::write(&local, b"welcome\n").unwrap();
                return ok("");
            }
            match inv.sftp_commands().as_slice() {
                ["ls -l \"/etc/motd\""] => {
                    ok("-rw-r--r--    1 root root 8 Jan 15 10:30 /etc/motd\n")
                }
                _ => respond_default(inv),
            }
        });

        assert_eq!(fx.conn.read_file("/etc/motd").unwrap(), b"welcome\n");
    }

    #[test]
    fn read_file_propagates_missing_path() {
        let fx = connected(|inv| match inv.sftp_commands().as_slice() {
            ["ls -l \"/gone\""] => fail("Can't ls: \"/gone\" not found"),
            _ => respond_default(inv),
        });
        assert_eq!(fx.conn.read_file("/gone").unwrap_err().kind(), ErrorKind::PathNotFound);
        assert_eq!(fx.runner.count(|i| i.transfer("get").is_some()), 0);
    }
}
