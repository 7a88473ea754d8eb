//! Process handles and decoded termination status

use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::task::AtomicWaker;
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::errors::{Result, SpawnError};

/// Exit code a child uses when the spawn machinery itself failed
/// (rebinding, exec, a panicking callback) rather than the work it ran.
pub const INTERNAL_FAILURE_CODE: i32 = 255;

/// Stage at which a child failed before or during divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildFailure {
    /// A requested descriptor could not be installed
    Rebind,
    /// Working directory or environment could not be applied
    Setup,
    /// `execve` returned
    Exec,
    /// The callback panicked
    Callback,
    /// The callback returned a status outside `0..=255`
    InvalidStatus,
    /// The child was reaped outside this crate and its status is unknown
    Lost,
}

impl ChildFailure {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            ChildFailure::Rebind => 1,
            ChildFailure::Setup => 2,
            ChildFailure::Exec => 3,
            ChildFailure::Callback => 4,
            ChildFailure::InvalidStatus => 5,
            ChildFailure::Lost => 6,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ChildFailure::Rebind),
            2 => Some(ChildFailure::Setup),
            3 => Some(ChildFailure::Exec),
            4 => Some(ChildFailure::Callback),
            5 => Some(ChildFailure::InvalidStatus),
            6 => Some(ChildFailure::Lost),
            _ => None,
        }
    }
}

impl fmt::Display for ChildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ChildFailure::Rebind => "descriptor rebind failed",
            ChildFailure::Setup => "child setup failed",
            ChildFailure::Exec => "exec failed",
            ChildFailure::Callback => "callback panicked",
            ChildFailure::InvalidStatus => "callback returned an out-of-range status",
            ChildFailure::Lost => "status was collected by someone else",
        };
        f.write_str(text)
    }
}

/// Decoded termination status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with a status code
    Exited(i32),
    /// Terminated by a signal
    Signaled(Signal),
}

impl ExitStatus {
    /// Decode a `waitpid` result. `None` while the child is still running.
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled(signal)),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }

    pub fn signal(&self) -> Option<Signal> {
        match self {
            ExitStatus::Exited(_) => None,
            ExitStatus::Signaled(signal) => Some(*signal),
        }
    }

    /// Single integer in shell convention: the code, or 128 + signal
    pub fn as_shell_code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => 128 + *signal as i32,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(signal) => write!(f, "killed by {}", signal),
        }
    }
}

/// Lifecycle state of a spawned child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(i32),
    Signaled(Signal),
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    status: ExitStatus,
    failure: Option<ChildFailure>,
}

struct HandleInner {
    pid: Pid,
    label: String,
    started: Instant,
    outcome: OnceLock<Outcome>,
    waker: AtomicWaker,
    report: Mutex<Option<OwnedFd>>,
}

/// Caller-visible token for one spawned child.
///
/// Clones share state. The status is stored exactly once, by the completion
/// notifier, and never changes afterwards.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl ProcessHandle {
    pub(crate) fn new(pid: Pid, label: String, report: Option<OwnedFd>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                pid,
                label,
                started: Instant::now(),
                outcome: OnceLock::new(),
                waker: AtomicWaker::new(),
                report: Mutex::new(report),
            }),
        }
    }

    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Time since the spawn call created the child
    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub fn state(&self) -> ProcessState {
        match self.status() {
            None => ProcessState::Running,
            Some(ExitStatus::Exited(code)) => ProcessState::Exited(code),
            Some(ExitStatus::Signaled(signal)) => ProcessState::Signaled(signal),
        }
    }

    pub fn status(&self) -> Option<ExitStatus> {
        self.inner.outcome.get().map(|o| o.status)
    }

    /// Internal failure reported by the child, if any
    pub fn failure(&self) -> Option<ChildFailure> {
        self.inner.outcome.get().and_then(|o| o.failure)
    }

    pub fn is_finished(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    /// Deliver `signal` to the child. A no-op once the child was reaped, so
    /// a recycled pid is never signaled.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.is_finished() {
            return Ok(());
        }
        match kill(self.inner.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SpawnError::Syscall(format!(
                "kill({}, {}) failed: {}",
                self.inner.pid, signal, e
            ))),
        }
    }

    /// Request cancellation with SIGTERM
    pub fn cancel(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Future resolving to the decoded status once the notifier reaps the
    /// child. Polling it never blocks.
    pub fn wait(&self) -> Completion {
        Completion {
            handle: self.clone(),
        }
    }

    /// Store the status. Returns `false` if it was already set.
    pub(crate) fn resolve(&self, status: ExitStatus) -> bool {
        let failure = match status {
            ExitStatus::Exited(INTERNAL_FAILURE_CODE) => self.read_failure_report(),
            _ => None,
        };
        self.store(Outcome { status, failure })
    }

    /// Resolve a child whose status can no longer be collected, as the
    /// internal failure code with [`ChildFailure::Lost`].
    pub(crate) fn resolve_lost(&self) -> bool {
        self.store(Outcome {
            status: ExitStatus::Exited(INTERNAL_FAILURE_CODE),
            failure: Some(ChildFailure::Lost),
        })
    }

    fn store(&self, outcome: Outcome) -> bool {
        // Drop the report pipe either way
        self.inner
            .report
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();

        let stored = self.inner.outcome.set(outcome).is_ok();
        if stored {
            debug!(
                "process {} ({}) finished: {}",
                self.inner.pid, self.inner.label, outcome.status
            );
            self.inner.waker.wake();
        }
        stored
    }

    fn read_failure_report(&self) -> Option<ChildFailure> {
        let fd = self
            .inner
            .report
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()?;
        let mut byte = [0u8; 1];
        let mut file = File::from(fd);
        loop {
            match file.read(&mut byte) {
                Ok(1) => return ChildFailure::from_byte(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                _ => return None,
            }
        }
    }
}

/// Future returned by [`ProcessHandle::wait`]
pub struct Completion {
    handle: ProcessHandle,
}

impl Future for Completion {
    type Output = ExitStatus;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(status) = self.handle.status() {
            return Poll::Ready(status);
        }
        self.handle.inner.waker.register(cx.waker());
        match self.handle.status() {
            Some(status) => Poll::Ready(status),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::stream::pipe;
    use futures::FutureExt;
    use std::io::Write;

    fn fake_handle(pid: i32) -> ProcessHandle {
        ProcessHandle::new(Pid::from_raw(pid), format!("fake-{}", pid), None)
    }

    #[test]
    fn decode_exit_and_signal() {
        let pid = Pid::from_raw(10);
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Exited(pid, 3)),
            Some(ExitStatus::Exited(3))
        );
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(ExitStatus::Signaled(Signal::SIGKILL))
        );
        assert_eq!(ExitStatus::from_wait_status(WaitStatus::StillAlive), None);
    }

    #[test]
    fn exit_status_accessors() {
        let ok = ExitStatus::Exited(0);
        assert!(ok.success());
        assert_eq!(ok.code(), Some(0));
        assert_eq!(ok.signal(), None);

        let killed = ExitStatus::Signaled(Signal::SIGTERM);
        assert!(!killed.success());
        assert_eq!(killed.code(), None);
        assert_eq!(killed.as_shell_code(), 128 + 15);
        assert_eq!(killed.to_string(), "killed by SIGTERM");
    }

    #[test]
    fn failure_byte_codes_round_trip() {
        for failure in [
            ChildFailure::Rebind,
            ChildFailure::Setup,
            ChildFailure::Exec,
            ChildFailure::Callback,
            ChildFailure::InvalidStatus,
            ChildFailure::Lost,
        ] {
            assert_eq!(ChildFailure::from_byte(failure.as_byte()), Some(failure));
        }
        assert_eq!(ChildFailure::from_byte(0), None);
    }

    #[test]
    fn handle_starts_running() {
        let handle = fake_handle(100);
        assert_eq!(handle.state(), ProcessState::Running);
        assert!(handle.status().is_none());
        assert!(!handle.is_finished());
        assert_eq!(handle.label(), "fake-100");
    }

    #[test]
    fn status_is_set_at_most_once() {
        let handle = fake_handle(101);
        assert!(handle.resolve(ExitStatus::Exited(7)));
        assert!(!handle.resolve(ExitStatus::Exited(9)));
        assert_eq!(handle.state(), ProcessState::Exited(7));
        assert_eq!(handle.clone().status(), Some(ExitStatus::Exited(7)));
    }

    #[test]
    fn wait_resolves_after_status_is_set() {
        let handle = fake_handle(102);
        let mut completion = handle.wait();
        assert!((&mut completion).now_or_never().is_none());

        handle.resolve(ExitStatus::Signaled(Signal::SIGTERM));
        assert_eq!(
            completion.now_or_never(),
            Some(ExitStatus::Signaled(Signal::SIGTERM))
        );
    }

    #[test]
    fn internal_code_reads_failure_report() {
        let (read, write) = pipe().unwrap();
        let mut writer = File::from(write);
        writer.write_all(&[ChildFailure::Exec.as_byte()]).unwrap();
        drop(writer);

        let handle = ProcessHandle::new(Pid::from_raw(103), "exec".to_string(), Some(read));
        handle.resolve(ExitStatus::Exited(INTERNAL_FAILURE_CODE));
        assert_eq!(handle.failure(), Some(ChildFailure::Exec));
    }

    #[test]
    fn lost_status_wakes_waiter() {
        let handle = fake_handle(105);
        let mut completion = handle.wait();
        assert!((&mut completion).now_or_never().is_none());

        assert!(handle.resolve_lost());
        assert_eq!(
            completion.now_or_never(),
            Some(ExitStatus::Exited(INTERNAL_FAILURE_CODE))
        );
        assert_eq!(handle.failure(), Some(ChildFailure::Lost));
        assert!(!handle.resolve(ExitStatus::Exited(0)));
    }

    #[test]
    fn internal_code_without_report_is_plain_status() {
        let (read, write) = pipe().unwrap();
        drop(write);

        let handle = ProcessHandle::new(Pid::from_raw(104), "plain".to_string(), Some(read));
        handle.resolve(ExitStatus::Exited(INTERNAL_FAILURE_CODE));
        assert_eq!(handle.failure(), None);
        assert_eq!(handle.status(), Some(ExitStatus::Exited(255)));
    }

    #[test]
    fn signal_after_resolution_is_noop() {
        let handle = fake_handle(i32::MAX - 1);
        handle.resolve(ExitStatus::Exited(0));
        assert!(handle.cancel().is_ok());
    }
}
