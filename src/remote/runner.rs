use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::runtime::{Builder, Runtime};

/// Captured result of one finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `-1` when the process was terminated by a signal.
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    /// The process outlived its time limit and was killed.
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Executes external programs on behalf of a connection.
///
/// Every remote operation funnels through this trait, which makes it the seam
/// where tests substitute a scripted runner for `ssh`/`sftp`.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, feed `stdin` (if any) and wait for it to
    /// exit. With `timeout: None` the call waits indefinitely.
    fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, RunError>;
}

/// Spawns real processes on a private tokio runtime.
///
/// Calls block the invoking thread. They must not be made from inside an
/// async task; wrap them in `spawn_blocking` there.
pub struct ProcessRunner {
    runtime: Runtime,
}

impl fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRunner").finish_non_exhaustive()
    }
}

impl ProcessRunner {
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tfm-remote-io")
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    async fn run_async(
        program: &str,
        args: &[String],
        stdin: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, RunError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout kills the child.
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                // The process may exit before reading everything (e.g. a
                // failed login); its stderr is more useful than EPIPE.
                if e.kind() != io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let wait = child.wait_with_output();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| RunError::TimedOut(limit))??,
            None => wait.await?,
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, RunError> {
        tracing::trace!("exec {} {}", program, args.join(" "));
        self.runtime
            .block_on(Self::run_async(program, args, stdin, timeout))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_output_and_status() {
        let runner = ProcessRunner::new().unwrap();
        let out = runner
            .run("sh", &["-c".into(), "cat; echo oops >&2; exit 3".into()], Some("hello\n"), None)
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.status, 3);
        assert!(!out.success());
    }

    #[test]
    fn kills_process_after_timeout() {
        let runner = ProcessRunner::new().unwrap();
        let err = runner
            .run("sleep", &["5".into()], None, Some(Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, RunError::TimedOut(_)));
    }
}
