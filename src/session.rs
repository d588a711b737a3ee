//! Interactive program sessions
//!
//! A session wraps one running program (usually a `lxc exec` or
//! `docker exec` process driving checkbox inside a machine). Background
//! reader tasks collect everything the program prints into a buffer that
//! only ever grows, and announce new output through a watch channel. When
//! every reader has hit end-of-file the channel closes, which is how
//! waiters learn that no more output will come.
//!
//! The program is started in its own process group so that a timeout can
//! kill it together with everything it spawned.

use regex::Regex;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::common::{Error, Result};
use crate::keys::Signal;

/// How long to wait for the readers to drain after the program exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a program that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// stdout and stderr interleaved in arrival order
    pub combined: String,
}

impl ExecuteResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Text to look for in a program's output
#[derive(Debug, Clone)]
pub enum Pattern {
    Exact(String),
    Regex(Regex),
}

impl Pattern {
    pub fn exact(text: impl Into<String>) -> Self {
        Pattern::Exact(text.into())
    }

    pub fn regex(expr: &str) -> Result<Self> {
        Regex::new(expr)
            .map(Pattern::Regex)
            .map_err(|e| Error::Config(format!("invalid regular expression '{}': {}", expr, e)))
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Pattern::Exact(s) => haystack.contains(s.as_str()),
            Pattern::Regex(r) => r.is_match(haystack),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Pattern::Exact(s) => s,
            Pattern::Regex(r) => r.as_str(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ANSI escape expression is valid")
    })
}

/// Remove terminal escape sequences and carriage returns from output
pub fn strip_ansi(text: &str) -> String {
    ansi_escape().replace_all(text, "").replace('\r', "")
}

#[derive(Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
}

impl Captured {
    fn text(bytes: &[u8]) -> String {
        strip_ansi(&String::from_utf8_lossy(bytes))
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// A running program whose output can be awaited and whose input can be fed
pub struct InteractiveSession {
    label: String,
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    captured: Arc<Mutex<Captured>>,
    updates: watch::Receiver<u64>,
    readers: Vec<JoinHandle<()>>,
    exit_code: Option<i32>,
}

impl InteractiveSession {
    /// Start `command` with piped standard streams in a new process group
    ///
    /// `label` names the session in logs and errors (usually the machine name).
    pub fn spawn(label: &str, mut command: Command) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Error::session_io(label, format!("failed to start program: {}", e)))?;
        let pid = child.id();
        tracing::debug!(session = %label, pid = ?pid, "Program started");

        let captured = Arc::new(Mutex::new(Captured::default()));
        let (tx, updates) = watch::channel(0u64);
        let tx = Arc::new(tx);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                label.to_string(),
                stdout,
                StreamKind::Stdout,
                captured.clone(),
                tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                label.to_string(),
                stderr,
                StreamKind::Stderr,
                captured.clone(),
                tx.clone(),
            ));
        }
        // The readers own the only senders now, the channel closes with them
        drop(tx);

        Ok(Self {
            label: label.to_string(),
            stdin: child.stdin.take(),
            child,
            pid,
            captured,
            updates,
            readers,
            exit_code: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Write raw bytes to the program's input
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::session_io(&self.label, "program input is closed"))?;
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| Error::session_io(&self.label, e))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::session_io(&self.label, e))?;
        Ok(())
    }

    /// Close the program's input (end-of-file)
    pub fn close_input(&mut self) {
        self.stdin.take();
    }

    /// Snapshot of everything printed so far, stdout and stderr combined
    pub fn output(&self) -> String {
        self.with_captured(|c| Captured::text(&c.combined))
    }

    /// Whether all output streams reached end-of-file
    pub fn output_closed(&self) -> bool {
        self.updates.has_changed().is_err()
    }

    /// Wait until `pattern` appears anywhere in the output
    ///
    /// The whole output history is searched, so text printed before this call
    /// still matches. Returns early with an error once the output is closed
    /// without a match.
    pub async fn expect(&mut self, pattern: &Pattern, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut rx = self.updates.clone();

        loop {
            rx.borrow_and_update();
            if pattern.is_match(&self.output()) {
                tracing::debug!(session = %self.label, pattern = %pattern, "Pattern found");
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.not_found(pattern, started, false));
            }

            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // Output closed: nothing new can arrive after this check
                    if pattern.is_match(&self.output()) {
                        return Ok(());
                    }
                    return Err(self.not_found(pattern, started, true));
                }
                Err(_) => {
                    if pattern.is_match(&self.output()) {
                        return Ok(());
                    }
                    return Err(self.not_found(pattern, started, false));
                }
            }
        }
    }

    /// Watch the output for `window` and fail if `pattern` shows up
    ///
    /// Succeeds early when the output closes without the pattern.
    pub async fn expect_not(&mut self, pattern: &Pattern, window: Duration) -> Result<()> {
        let deadline = Instant::now() + window;
        let mut rx = self.updates.clone();

        loop {
            rx.borrow_and_update();
            if pattern.is_match(&self.output()) {
                return Err(Error::Assertion(format!(
                    "'{}' was printed by {}",
                    pattern, self.label
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }

            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    if pattern.is_match(&self.output()) {
                        return Err(Error::Assertion(format!(
                            "'{}' was printed by {}",
                            pattern, self.label
                        )));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Wait for the program to terminate
    ///
    /// When `timeout` elapses the whole process group is killed and the
    /// reported code is 137. The exit code is remembered, later calls return
    /// it immediately together with the output captured so far.
    pub async fn wait(&mut self, timeout: Duration) -> Result<ExecuteResult> {
        if let Some(code) = self.exit_code {
            return Ok(self.result(code));
        }

        let status = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => status.map_err(|e| Error::session_io(&self.label, e))?,
            Err(_) => {
                tracing::warn!(
                    session = %self.label,
                    timeout_secs = timeout.as_secs_f64(),
                    "Program did not terminate in time, killing it"
                );
                self.kill_group(Signal::Kill);
                let _ = self.child.start_kill();
                self.child
                    .wait()
                    .await
                    .map_err(|e| Error::session_io(&self.label, e))?
            }
        };

        let code = exit_code(status);
        self.exit_code = Some(code);
        self.stdin.take();
        self.drain_readers().await;
        tracing::debug!(session = %self.label, exit_code = code, "Program terminated");
        Ok(self.result(code))
    }

    /// Exit code if the program already terminated
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Deliver a signal to the program's process group
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        let pid = self
            .pid
            .ok_or_else(|| Error::session_io(&self.label, "program has no process id"))?;
        tracing::debug!(session = %self.label, pid, signal = ?signal, "Sending signal");
        self.kill_group(signal);
        Ok(())
    }

    fn result(&self, exit_code: i32) -> ExecuteResult {
        self.with_captured(|c| ExecuteResult {
            exit_code,
            stdout: Captured::text(&c.stdout),
            stderr: Captured::text(&c.stderr),
            combined: Captured::text(&c.combined),
        })
    }

    fn not_found(&self, pattern: &Pattern, started: Instant, closed: bool) -> Error {
        Error::PatternNotFound {
            pattern: pattern.to_string(),
            waited_ms: started.elapsed().as_millis(),
            closed,
        }
    }

    fn with_captured<T>(&self, f: impl FnOnce(&Captured) -> T) -> T {
        match self.captured.lock() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    async fn drain_readers(&mut self) {
        for reader in self.readers.drain(..) {
            // Grandchildren may hold the pipes open after the program exits
            let abort = reader.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                tracing::debug!(session = %self.label, "Output reader did not finish, aborting");
                abort.abort();
            }
        }
    }

    #[cfg(unix)]
    fn kill_group(&self, signal: Signal) {
        if let Some(pid) = self.pid {
            // SAFETY: kill(2) with a negative pid targets the process group
            // created for this program at spawn time
            unsafe {
                libc::kill(-(pid as libc::pid_t), signal.number());
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self, _signal: Signal) {}
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            self.kill_group(Signal::Kill);
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn spawn_reader<R>(
    label: String,
    mut stream: R,
    kind: StreamKind,
    captured: Arc<Mutex<Captured>>,
    tx: Arc<watch::Sender<u64>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    tracing::trace!(session = %label, "{}", String::from_utf8_lossy(chunk));
                    if let Ok(mut c) = captured.lock() {
                        match kind {
                            StreamKind::Stdout => c.stdout.extend_from_slice(chunk),
                            StreamKind::Stderr => c.stderr.extend_from_slice(chunk),
                        }
                        c.combined.extend_from_slice(chunk);
                    }
                    tx.send_modify(|n| *n = n.wrapping_add(1));
                }
                Err(e) => {
                    tracing::debug!(session = %label, error = %e, "Output stream error");
                    break;
                }
            }
        }
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;32mPASS\x1b[0m\r\n"), "PASS\n");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_pattern_matching() {
        assert!(Pattern::exact("Select tests").is_match("== Select tests =="));
        assert!(!Pattern::exact("a.c").is_match("abc"));
        assert!(Pattern::regex("a.c").unwrap().is_match("abc"));
        assert!(Pattern::regex("(").unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_exit_code_and_output() {
        let mut session =
            InteractiveSession::spawn("test", sh("echo out; echo err >&2; exit 3")).unwrap();
        let result = session.wait(Duration::from_secs(10)).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(result.combined.contains("out"));
        assert!(result.combined.contains("err"));
    }

    #[tokio::test]
    async fn test_wait_timeout_kills_group() {
        let mut session = InteractiveSession::spawn("test", sh("sleep 10; echo done")).unwrap();
        let started = std::time::Instant::now();
        let result = session.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(result.exit_code, 137);
        assert!(!result.combined.contains("done"));
        assert!(started.elapsed() < Duration::from_secs(5));
        // Cached
        assert_eq!(session.wait(Duration::ZERO).await.unwrap().exit_code, 137);
    }

    #[tokio::test]
    async fn test_expect_searches_full_history() {
        let mut session =
            InteractiveSession::spawn("test", sh("echo first; echo second; sleep 5")).unwrap();
        let second = Pattern::exact("second");
        let first = Pattern::exact("first");
        session.expect(&second, Duration::from_secs(5)).await.unwrap();
        // Already printed before the second match, still found
        session.expect(&first, Duration::from_secs(1)).await.unwrap();
        session.signal(Signal::Kill).unwrap();
        assert_eq!(session.wait(Duration::from_secs(5)).await.unwrap().exit_code, 137);
    }

    #[tokio::test]
    async fn test_expect_returns_early_when_output_closes() {
        let mut session = InteractiveSession::spawn("test", sh("echo nothing to see")).unwrap();
        let started = std::time::Instant::now();
        let err = session
            .expect(&Pattern::exact("never"), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PatternNotFound { closed: true, .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_expect_times_out() {
        let mut session = InteractiveSession::spawn("test", sh("sleep 5")).unwrap();
        let err = session
            .expect(&Pattern::exact("never"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PatternNotFound { closed: false, .. }));
    }

    #[tokio::test]
    async fn test_send_is_echoed_back() {
        let mut session = InteractiveSession::spawn("test", Command::new("cat")).unwrap();
        session.send(b"hello metabox\n").await.unwrap();
        session
            .expect(&Pattern::exact("hello metabox"), Duration::from_secs(5))
            .await
            .unwrap();
        session.close_input();
        assert_eq!(session.wait(Duration::from_secs(5)).await.unwrap().exit_code, 0);
    }

    #[tokio::test]
    async fn test_expect_not() {
        let mut session = InteractiveSession::spawn("test", sh("echo harmless; sleep 5")).unwrap();
        session
            .expect_not(&Pattern::exact("Traceback"), Duration::from_millis(200))
            .await
            .unwrap();
        let err = session
            .expect_not(&Pattern::exact("harmless"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_assertion());
    }

    #[tokio::test]
    async fn test_interrupt_reports_130() {
        let mut session = InteractiveSession::spawn("test", sh("exec sleep 10")).unwrap();
        // Give the shell a moment to exec
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.signal(Signal::Interrupt).unwrap();
        assert_eq!(session.wait(Duration::from_secs(5)).await.unwrap().exit_code, 130);
    }
}
