//! One exec channel to a single endpoint.
//!
//! A [`Session`] runs one command at a time (enforced by `&mut self`) and
//! captures complete stdout/stderr even for chatty or long-running commands.
//! Output draining, stdin feeding and the deadline all share a single
//! `select!` per loop iteration; issuing separate blocking reads per stream
//! can deadlock when the remote process blocks on a full stderr buffer
//! while the caller is blocked reading stdout.
//!
//! The transport is a spawned `ssh`/`scp` (or a local shell), so each
//! execute opens its own channel and the session holds no persistent
//! handle between calls; dropping the session releases everything.

mod endpoint;

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tracing::debug;

use crate::error::SessionError;
use crate::retry::{RetryPolicy, retry};

pub use endpoint::Endpoint;

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);
const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistroInfo {
    pub id: String,
    pub version: String,
}

impl DistroInfo {
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            id: "Unknown".to_owned(),
            version: String::new(),
        }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.id == "Unknown"
    }
}

pub struct Session {
    endpoint: Endpoint,
}

impl Session {
    /// Opens a session, verifying reachability with a trivial command and
    /// retrying up to `retry_count` times with `retry_wait` between tries.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Connect` once the retry budget is exhausted.
    pub async fn connect(
        endpoint: Endpoint,
        retry_count: u32,
        retry_wait: Duration,
    ) -> Result<Self, SessionError> {
        let policy = RetryPolicy::bounded(retry_count.max(1), retry_wait);
        let probe_endpoint = endpoint.clone();
        let connected = retry(policy, "session connect", move || {
            let endpoint = probe_endpoint.clone();
            async move { reach_once(&endpoint).await }
        })
        .await;
        match connected {
            Ok(()) => Ok(Self { endpoint }),
            Err(message) => Err(SessionError::Connect {
                endpoint: endpoint.describe(),
                attempts: retry_count.max(1),
                message,
            }),
        }
    }

    /// Builds a session without a reachability probe. Used for the local
    /// endpoint where spawning a shell cannot meaningfully fail to connect.
    #[must_use]
    pub fn open(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Runs one command, returning its exit status and complete output.
    /// A non-zero exit status is data, not an error.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Timeout` when the wall-clock deadline passes,
    /// or `SessionError::Spawn` when the transport cannot start.
    pub async fn execute(
        &mut self,
        cmd: &str,
        timeout: Duration,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutcome, SessionError> {
        self.execute_observed(cmd, timeout, stdin, None, None).await
    }

    /// Like [`Session::execute`] but raises on a non-zero exit status.
    ///
    /// # Errors
    ///
    /// All of [`Session::execute`]'s errors plus `SessionError::NonZeroExit`.
    pub async fn execute_checked(
        &mut self,
        cmd: &str,
        timeout: Duration,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutcome, SessionError> {
        let outcome = self.execute(cmd, timeout, stdin).await?;
        if outcome.status != 0 {
            return Err(SessionError::NonZeroExit {
                status: outcome.status,
            });
        }
        Ok(outcome)
    }

    /// Full execute variant: optional per-stdout-line observer (used to
    /// stream interim benchmark records) and an optional abort signal.
    ///
    /// # Errors
    ///
    /// `SessionError::Timeout` on deadline, `SessionError::Aborted` when the
    /// abort signal fires, `SessionError::Spawn` when spawning fails.
    pub async fn execute_observed(
        &mut self,
        cmd: &str,
        timeout: Duration,
        stdin: Option<&[u8]>,
        mut on_stdout_line: Option<&mut (dyn FnMut(&str) + Send)>,
        mut abort: Option<watch::Receiver<bool>>,
    ) -> Result<ExecOutcome, SessionError> {
        let argv = self.endpoint.exec_argv(cmd);
        let mut child = spawn_child(&argv, stdin.is_some())?;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let timeout_sleep = match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline),
            None => tokio::time::sleep(timeout),
        };
        tokio::pin!(timeout_sleep);

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdin_pipe = child.stdin.take();
        let mut pending_stdin: &[u8] = stdin.unwrap_or(&[]);
        if pending_stdin.is_empty() {
            stdin_pipe = None;
        }

        let mut stdout_buf: Vec<u8> = Vec::new();
        let mut stderr_buf: Vec<u8> = Vec::new();
        let mut line_cursor: usize = 0;
        let mut out_chunk = [0u8; READ_CHUNK_SIZE];
        let mut err_chunk = [0u8; READ_CHUNK_SIZE];
        let abort_armed = abort.is_some();

        while stdout_pipe.is_some() || stderr_pipe.is_some() {
            tokio::select! {
                read = read_some(stdout_pipe.as_mut(), &mut out_chunk), if stdout_pipe.is_some() => {
                    match read {
                        Ok(0) | Err(_) => stdout_pipe = None,
                        Ok(bytes) => {
                            if let Some(chunk) = out_chunk.get(..bytes) {
                                stdout_buf.extend_from_slice(chunk);
                            }
                            drain_lines(&stdout_buf, &mut line_cursor, &mut on_stdout_line);
                        }
                    }
                }
                read = read_some(stderr_pipe.as_mut(), &mut err_chunk), if stderr_pipe.is_some() => {
                    match read {
                        Ok(0) | Err(_) => stderr_pipe = None,
                        Ok(bytes) => {
                            if let Some(chunk) = err_chunk.get(..bytes) {
                                stderr_buf.extend_from_slice(chunk);
                            }
                        }
                    }
                }
                wrote = write_some(stdin_pipe.as_mut(), pending_stdin), if stdin_pipe.is_some() => {
                    match wrote {
                        Ok(0) | Err(_) => stdin_pipe = None,
                        Ok(bytes) => {
                            pending_stdin = pending_stdin.get(bytes..).unwrap_or(&[]);
                            if pending_stdin.is_empty() {
                                stdin_pipe = None;
                            }
                        }
                    }
                }
                _ = &mut timeout_sleep => {
                    kill_quietly(&mut child).await;
                    return Err(SessionError::Timeout {
                        timeout_ms: duration_ms(timeout),
                        elapsed_ms: duration_ms(started.elapsed()),
                    });
                }
                () = wait_abort(abort.as_mut()), if abort_armed => {
                    kill_quietly(&mut child).await;
                    return Err(SessionError::Aborted);
                }
            }
        }
        drop(stdin_pipe);

        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(tokio::time::Instant::now()),
            None => Duration::ZERO,
        };
        let status = match tokio::time::timeout(remaining.max(Duration::from_millis(1)), child.wait())
            .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(SessionError::Spawn { source: err }),
            Err(_elapsed) => {
                kill_quietly(&mut child).await;
                return Err(SessionError::Timeout {
                    timeout_ms: duration_ms(timeout),
                    elapsed_ms: duration_ms(started.elapsed()),
                });
            }
        };

        Ok(ExecOutcome {
            status: exit_code(&status),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        })
    }

    /// Pushes a local file to the endpoint.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Transfer`; the session remains usable.
    pub async fn put(&mut self, local: &str, remote: &str) -> Result<(), SessionError> {
        match self.endpoint.put_argv(local, remote) {
            None => copy_file(local, remote).await,
            Some(argv) => run_transfer(&argv, local).await,
        }
    }

    /// Pulls a remote file from the endpoint.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Transfer`; the session remains usable.
    pub async fn get(&mut self, remote: &str, local: &str) -> Result<(), SessionError> {
        match self.endpoint.get_argv(remote, local) {
            None => copy_file(remote, local).await,
            Some(argv) => run_transfer(&argv, remote).await,
        }
    }

    /// Best-effort OS identification; failures degrade to the Unknown
    /// sentinel instead of propagating.
    pub async fn probe(&mut self) -> DistroInfo {
        match self.execute("cat /etc/os-release", PROBE_TIMEOUT, None).await {
            Ok(outcome) if outcome.status == 0 => {
                parse_os_release(&outcome.stdout).unwrap_or_else(DistroInfo::unknown)
            }
            Ok(_) | Err(_) => DistroInfo::unknown(),
        }
    }
}

async fn reach_once(endpoint: &Endpoint) -> Result<(), String> {
    let argv = endpoint.exec_argv("true");
    let mut child =
        spawn_child(&argv, false).map_err(|err| format!("spawn failed: {}", err))?;
    match tokio::time::timeout(CONNECT_PROBE_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(format!("probe exited with {}", exit_code(&status))),
        Ok(Err(err)) => Err(format!("probe failed: {}", err)),
        Err(_elapsed) => {
            kill_quietly(&mut child).await;
            Err("probe timed out".to_owned())
        }
    }
}

fn spawn_child(argv: &[String], pipe_stdin: bool) -> Result<Child, SessionError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(SessionError::Spawn {
            source: std::io::Error::other("empty argv"),
        });
    };
    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if pipe_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    command
        .spawn()
        .map_err(|err| SessionError::Spawn { source: err })
}

async fn read_some<TPipe>(
    pipe: Option<&mut TPipe>,
    chunk: &mut [u8],
) -> std::io::Result<usize>
where
    TPipe: AsyncRead + Unpin,
{
    match pipe {
        Some(pipe) => pipe.read(chunk).await,
        None => std::future::pending().await,
    }
}

async fn write_some(pipe: Option<&mut ChildStdin>, data: &[u8]) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.write(data).await,
        None => std::future::pending().await,
    }
}

async fn wait_abort(abort: Option<&mut watch::Receiver<bool>>) {
    let Some(rx) = abort else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Abort sender dropped; no abort can arrive anymore.
            return std::future::pending().await;
        }
    }
}

fn drain_lines(
    buffer: &[u8],
    cursor: &mut usize,
    observer: &mut Option<&mut (dyn FnMut(&str) + Send)>,
) {
    let Some(observer) = observer.as_mut() else {
        return;
    };
    while let Some(rel) = buffer
        .get(*cursor..)
        .and_then(|tail| tail.iter().position(|byte| *byte == b'\n'))
    {
        let end = cursor.saturating_add(rel);
        if let Some(raw) = buffer.get(*cursor..end) {
            let line = String::from_utf8_lossy(raw);
            observer(line.trim_end_matches('\r'));
        }
        *cursor = end.saturating_add(1);
    }
}

async fn kill_quietly(child: &mut Child) {
    if child.start_kill().is_err() {
        // Already exited.
    }
    if child.wait().await.is_err() {
        // Nothing left to reap.
    }
}

async fn copy_file(from: &str, to: &str) -> Result<(), SessionError> {
    tokio::fs::copy(from, to)
        .await
        .map(|_bytes| ())
        .map_err(|err| SessionError::Transfer {
            path: from.to_owned(),
            message: err.to_string(),
        })
}

async fn run_transfer(argv: &[String], path: &str) -> Result<(), SessionError> {
    let mut child = spawn_child(argv, false).map_err(|err| SessionError::Transfer {
        path: path.to_owned(),
        message: err.to_string(),
    })?;
    match tokio::time::timeout(TRANSFER_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => Err(SessionError::Transfer {
            path: path.to_owned(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(err)) => Err(SessionError::Transfer {
            path: path.to_owned(),
            message: err.to_string(),
        }),
        Err(_elapsed) => Err(SessionError::Transfer {
            path: path.to_owned(),
            message: "transfer timed out".to_owned(),
        }),
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            debug!("Child terminated by signal {}", signal);
            return i64::from(128_i32.saturating_add(signal));
        }
    }
    -1
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_os_release(stdout: &str) -> Option<DistroInfo> {
    let mut id = None;
    let mut version = None;
    for line in stdout.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            id = Some(value.trim_matches('"').to_owned());
        } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
            version = Some(value.trim_matches('"').to_owned());
        }
    }
    Some(DistroInfo {
        id: id?,
        version: version.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};

    fn local() -> Session {
        Session::open(Endpoint::Local)
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_status() -> AppResult<()> {
        let mut session = local();
        let outcome = session
            .execute("printf out; printf err 1>&2; exit 3", Duration::from_secs(5), None)
            .await
            .map_err(AppError::session)?;
        if outcome.status != 3 || outcome.stdout != "out" || outcome.stderr != "err" {
            return Err(AppError::broker(format!(
                "Unexpected outcome: {} {:?} {:?}",
                outcome.status, outcome.stdout, outcome.stderr
            )));
        }
        Ok(())
    }

    #[tokio::test]
    async fn captures_large_combined_output_without_truncation() -> AppResult<()> {
        let mut session = local();
        let cmd = "head -c 70000 /dev/zero | tr '\\0' a; head -c 70000 /dev/zero | tr '\\0' b 1>&2";
        let outcome = session
            .execute(cmd, Duration::from_secs(20), None)
            .await
            .map_err(AppError::session)?;
        if outcome.stdout.len() != 70_000 || outcome.stderr.len() != 70_000 {
            return Err(AppError::broker(format!(
                "Truncated output: {} {}",
                outcome.stdout.len(),
                outcome.stderr.len()
            )));
        }
        Ok(())
    }

    #[tokio::test]
    async fn captures_large_output_with_mid_stream_sleep() -> AppResult<()> {
        let mut session = local();
        let cmd = "head -c 40000 /dev/zero | tr '\\0' a; sleep 1; \
                   head -c 40000 /dev/zero | tr '\\0' a; \
                   head -c 65000 /dev/zero | tr '\\0' b 1>&2";
        let outcome = session
            .execute(cmd, Duration::from_secs(20), None)
            .await
            .map_err(AppError::session)?;
        if outcome.stdout.len() != 80_000 || outcome.stderr.len() != 65_000 {
            return Err(AppError::broker(format!(
                "Truncated output: {} {}",
                outcome.stdout.len(),
                outcome.stderr.len()
            )));
        }
        Ok(())
    }

    #[tokio::test]
    async fn enforces_the_deadline() -> AppResult<()> {
        let mut session = local();
        let started = Instant::now();
        let result = session
            .execute("sleep 5", Duration::from_millis(300), None)
            .await;
        let elapsed = started.elapsed();
        match result {
            Err(SessionError::Timeout { timeout_ms, .. }) if timeout_ms == 300 => {}
            other => {
                return Err(AppError::broker(format!(
                    "Expected timeout, got {:?}",
                    other.map(|outcome| outcome.status)
                )));
            }
        }
        if elapsed < Duration::from_millis(300) || elapsed > Duration::from_millis(1500) {
            return Err(AppError::broker(format!(
                "Deadline not enforced tightly: {:?}",
                elapsed
            )));
        }
        Ok(())
    }

    #[tokio::test]
    async fn feeds_stdin_from_a_buffer() -> AppResult<()> {
        let mut session = local();
        let outcome = session
            .execute("cat", Duration::from_secs(5), Some(b"hello stdin"))
            .await
            .map_err(AppError::session)?;
        if outcome.stdout != "hello stdin" {
            return Err(AppError::broker(format!(
                "Unexpected stdout: {:?}",
                outcome.stdout
            )));
        }
        Ok(())
    }

    #[tokio::test]
    async fn observer_sees_each_stdout_line() -> AppResult<()> {
        let mut session = local();
        let mut lines: Vec<String> = Vec::new();
        let mut observer = |line: &str| lines.push(line.to_owned());
        let outcome = session
            .execute_observed(
                "printf 'one\\ntwo\\nthree\\n'",
                Duration::from_secs(5),
                None,
                Some(&mut observer),
                None,
            )
            .await
            .map_err(AppError::session)?;
        if outcome.status != 0 || lines != vec!["one", "two", "three"] {
            return Err(AppError::broker(format!("Unexpected lines: {:?}", lines)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn abort_signal_stops_the_command() -> AppResult<()> {
        let mut session = local();
        let (abort_tx, abort_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if abort_tx.send(true).is_err() {
                // Command already finished.
            }
        });
        let started = Instant::now();
        let result = session
            .execute_observed("sleep 5", Duration::from_secs(30), None, None, Some(abort_rx))
            .await;
        if !matches!(result, Err(SessionError::Aborted)) {
            return Err(AppError::broker("Expected abort".to_owned()));
        }
        if started.elapsed() > Duration::from_secs(3) {
            return Err(AppError::broker("Abort was not prompt".to_owned()));
        }
        Ok(())
    }

    #[tokio::test]
    async fn checked_execute_raises_on_nonzero() -> AppResult<()> {
        let mut session = local();
        let result = session
            .execute_checked("exit 9", Duration::from_secs(5), None)
            .await;
        match result {
            Err(SessionError::NonZeroExit { status: 9 }) => Ok(()),
            other => Err(AppError::broker(format!(
                "Expected NonZeroExit, got {:?}",
                other.map(|outcome| outcome.status)
            ))),
        }
    }

    #[tokio::test]
    async fn transfer_copies_files_on_the_local_endpoint() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        tokio::fs::write(&src, b"payload").await?;
        let mut session = local();
        session
            .put(&src.display().to_string(), &dst.display().to_string())
            .await
            .map_err(AppError::session)?;
        let copied = tokio::fs::read(&dst).await?;
        if copied != b"payload" {
            return Err(AppError::broker("Transfer mangled the file".to_owned()));
        }
        Ok(())
    }

    #[tokio::test]
    async fn failed_transfer_is_a_typed_error_and_session_survives() -> AppResult<()> {
        let mut session = local();
        let result = session.put("/definitely/not/here", "/tmp/nope").await;
        if !matches!(result, Err(SessionError::Transfer { .. })) {
            return Err(AppError::broker("Expected TransferError".to_owned()));
        }
        // Connection (such as it is) remains usable.
        let outcome = session
            .execute("printf ok", Duration::from_secs(5), None)
            .await
            .map_err(AppError::session)?;
        if outcome.stdout != "ok" {
            return Err(AppError::broker("Session unusable after transfer".to_owned()));
        }
        Ok(())
    }

    #[test]
    fn os_release_parsing_handles_quotes() {
        let parsed = parse_os_release("NAME=x\nID=\"ubuntu\"\nVERSION_ID=\"22.04\"\n");
        assert_eq!(
            parsed,
            Some(DistroInfo {
                id: "ubuntu".to_owned(),
                version: "22.04".to_owned(),
            })
        );
    }

    #[test]
    fn os_release_without_id_is_unknown() {
        assert!(parse_os_release("PRETTY_NAME=mystery\n").is_none());
    }
}
