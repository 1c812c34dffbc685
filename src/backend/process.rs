//! Rendering backend child process.
//!
//! The backend runs with its three standard streams piped to the proxy and
//! in its own process group, so shutdown signals reach anything it spawned.
//!
//! Shutdown escalates:
//! 1. drop the proxy's ends of the pipes and wait for a voluntary exit
//! 2. SIGTERM to the process group, wait again
//! 3. SIGKILL to the process group, wait once more

use std::fmt;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};

use crate::config::ShutdownGrace;
use crate::error::{ProxyError, Result};
use crate::transport::{BoxedReader, BoxedWriter};

/// Proxy-side ends of the backend's standard streams.
pub struct BackendIo {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
}

/// How the backend ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, if it exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if it was killed.
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit code for the proxy process, shell style for signals.
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Lifecycle capability the event loop needs from a backend.
pub trait ProcessTransport {
    /// Backend process id, if there is a real process.
    fn pid(&self) -> Option<u32>;

    /// Hand over the stream ends. Succeeds once.
    fn take_io(&mut self) -> Result<BackendIo>;

    /// Resolve when the backend exits. Cancel-safe.
    fn wait_exit(&mut self) -> impl Future<Output = Result<ExitOutcome>>;

    /// Stop the backend, escalating as configured.
    fn terminate(&mut self, grace: ShutdownGrace) -> impl Future<Output = Result<ExitOutcome>>;
}

/// A spawned backend process.
pub struct ChildProcess {
    child: Child,
    pid: u32,
    program: String,
    io: Option<BackendIo>,
    started: Instant,
}

impl ChildProcess {
    /// Spawn `argv[0]` with the remaining arguments.
    pub fn start(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProxyError::Config("no backend command given".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProxyError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child
            .id()
            .ok_or_else(|| ProxyError::Shutdown(format!("{} exited during startup", program)))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ProxyError::Protocol("backend pipes were not created".into()));
        };

        tracing::info!("started backend {} (pid {})", program, pid);

        Ok(Self {
            child,
            pid,
            program: program.clone(),
            io: Some(BackendIo {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
            }),
            started: Instant::now(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Time since the backend was spawned.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    async fn wait_within(&mut self, limit: Duration) -> Result<Option<ExitOutcome>> {
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(status) => Ok(Some(status?.into())),
            Err(_) => Ok(None),
        }
    }
}

impl ProcessTransport for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_io(&mut self) -> Result<BackendIo> {
        self.io
            .take()
            .ok_or_else(|| ProxyError::Protocol("backend pipes already taken".into()))
    }

    async fn wait_exit(&mut self) -> Result<ExitOutcome> {
        Ok(self.child.wait().await?.into())
    }

    async fn terminate(&mut self, grace: ShutdownGrace) -> Result<ExitOutcome> {
        self.io = None;

        if let Some(outcome) = self.wait_within(grace.exit).await? {
            tracing::info!("backend {} exited: {}", self.pid, outcome);
            return Ok(outcome);
        }

        tracing::warn!("backend {} still running after {:?}, sending SIGTERM", self.pid, grace.exit);
        signal_group(self.pid, libc::SIGTERM);
        if let Some(outcome) = self.wait_within(grace.term).await? {
            return Ok(outcome);
        }

        tracing::warn!("backend {} ignored SIGTERM for {:?}, sending SIGKILL", self.pid, grace.term);
        signal_group(self.pid, libc::SIGKILL);
        if let Some(outcome) = self.wait_within(grace.kill).await? {
            return Ok(outcome);
        }

        Err(ProxyError::Shutdown(format!(
            "backend {} still running {:?} after SIGKILL",
            self.pid, grace.kill
        )))
    }
}

/// Send `signal` to the process group led by `pid`.
fn signal_group(pid: u32, signal: libc::c_int) {
    // SAFETY: killpg has no memory effects; a stale group id fails with ESRCH.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if rc != 0 {
        tracing::debug!(
            "killpg({}, {}) failed: {}",
            pid,
            signal,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn argv(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn quick_grace() -> ShutdownGrace {
        ShutdownGrace {
            exit: Duration::from_millis(200),
            term: Duration::from_secs(2),
            kill: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitOutcome::exited(3).exit_code(), 3);
        assert_eq!(ExitOutcome::signaled(9).exit_code(), 137);
        assert_eq!(ExitOutcome::signaled(15).to_string(), "killed by signal 15");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = ChildProcess::start(&["/nonexistent/renderer".to_string()]).err().unwrap();
        assert!(matches!(err, ProxyError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_pipes_reach_child() {
        let mut child = ChildProcess::start(&argv("read line; echo \"PyMOL>$line\"")).unwrap();
        let mut io = child.take_io().unwrap();
        assert!(child.take_io().is_err());

        io.stdin.write_all(b"reset\n").await.unwrap();
        let mut lines = BufReader::new(io.stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PyMOL>reset");

        assert_eq!(child.wait_exit().await.unwrap(), ExitOutcome::exited(0));
    }

    #[tokio::test]
    async fn test_exit_code_passthrough() {
        let mut child = ChildProcess::start(&argv("exit 3")).unwrap();
        let outcome = child.wait_exit().await.unwrap();
        assert_eq!(outcome.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_terminate_voluntary_exit_on_stdin_close() {
        let mut child = ChildProcess::start(&argv("cat >/dev/null")).unwrap();
        let outcome = child.terminate(quick_grace()).await.unwrap();
        assert_eq!(outcome, ExitOutcome::exited(0));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigterm() {
        let mut child = ChildProcess::start(&argv("sleep 30")).unwrap();
        let outcome = child.terminate(quick_grace()).await.unwrap();
        assert_eq!(outcome.signal, Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let mut child = ChildProcess::start(&argv("trap '' TERM; sleep 30")).unwrap();
        let outcome = child.terminate(quick_grace()).await.unwrap();
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
    }
}
