//! Completion notification for spawned children
//!
//! Each live child is watched through a pidfd, which becomes readable when
//! the child terminates. Where `pidfd_open(2)` is unavailable (old kernels,
//! restrictive seccomp profiles) the notifier falls back to short poll
//! timeouts followed by a `waitpid(WNOHANG)` sweep.

use std::collections::HashMap;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use log::error;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::errors::{Result, SpawnError};
use crate::execution::stream::{CaptureReader, OutputCapture};
use crate::execution::{ExitStatus, ProcessHandle};
use crate::scheduler::ProcessRegistry;

/// Longest block when some child cannot be watched through a pidfd
const FALLBACK_SWEEP: Duration = Duration::from_millis(20);

fn pidfd_open(pid: Pid) -> Option<OwnedFd> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if ret < 0 {
        None
    } else {
        Some(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
    }
}

/// Observes child termination and output captures without blocking past a
/// caller-chosen timeout.
#[derive(Default)]
pub struct CompletionNotifier {
    pidfds: HashMap<i32, Option<OwnedFd>>,
    captures: Vec<CaptureReader>,
}

impl CompletionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting everything written to the pipe behind `fd`
    pub fn watch_output(&mut self, fd: OwnedFd) -> Result<OutputCapture> {
        let (reader, capture) = CaptureReader::new(fd)?;
        self.captures.push(reader);
        Ok(capture)
    }

    /// Captures still waiting for end-of-file
    pub fn pending_captures(&self) -> usize {
        self.captures.len()
    }

    /// Whether anything can still be resolved by polling
    pub fn has_work(&self, registry: &ProcessRegistry) -> bool {
        !registry.is_empty() || !self.captures.is_empty()
    }

    /// Wait up to `timeout` for children to terminate or captures to become
    /// readable, then resolve whatever is ready.
    ///
    /// Terminated children are reaped, their decoded status is stored on the
    /// handle (waking the awaiting task) and they leave the registry. The
    /// resolved handles are returned in the order they were observed.
    ///
    /// A child that can no longer be waited for (reaped elsewhere) is
    /// dropped from the registry and resolved with
    /// [`ChildFailure::Lost`](crate::ChildFailure::Lost).
    pub fn poll(
        &mut self,
        registry: &ProcessRegistry,
        timeout: Duration,
    ) -> Result<Vec<ProcessHandle>> {
        let live = registry.all_live();
        self.refresh_pidfds(&live);

        if live.is_empty() && self.captures.is_empty() {
            return Ok(Vec::new());
        }

        let timeout = if self.pidfds.values().any(Option::is_none) {
            timeout.min(FALLBACK_SWEEP)
        } else {
            timeout
        };
        let readable = self.wait_readable(timeout)?;

        let mut finished = Vec::new();
        for (index, reader) in self.captures.iter_mut().enumerate() {
            if readable.get(index).copied().unwrap_or(false) && reader.drain() {
                finished.push(index);
            }
        }
        for index in finished.into_iter().rev() {
            self.captures.remove(index);
        }

        let mut resolved = Vec::new();
        for handle in live {
            match try_reap(handle.pid()) {
                Ok(Some(status)) => {
                    self.finish(registry, &handle, status);
                    resolved.push(handle);
                }
                Ok(None) => {}
                Err(e) => {
                    // One unreapable child must not stall the others
                    error!(
                        "dropping process {} ({}): {}",
                        handle.pid(),
                        handle.label(),
                        e
                    );
                    self.abandon(registry, &handle);
                    resolved.push(handle);
                }
            }
        }
        Ok(resolved)
    }

    /// Block (in bounded poll slices) until `handle` is resolved
    pub fn wait_blocking(
        &mut self,
        registry: &ProcessRegistry,
        handle: &ProcessHandle,
        slice: Duration,
    ) -> Result<ExitStatus> {
        loop {
            if let Some(status) = handle.status() {
                return Ok(status);
            }
            if !registry.contains(handle.pid()) {
                return Err(SpawnError::InvalidRequest(format!(
                    "process {} is not registered",
                    handle.pid()
                )));
            }
            self.poll(registry, slice)?;
        }
    }

    /// Poll until the registry is empty or `deadline` passes. Returns
    /// whether the registry drained.
    pub fn drain_until(
        &mut self,
        registry: &ProcessRegistry,
        deadline: Instant,
        slice: Duration,
    ) -> Result<bool> {
        while !registry.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.poll(registry, slice.min(deadline - now))?;
        }
        Ok(true)
    }

    fn refresh_pidfds(&mut self, live: &[ProcessHandle]) {
        self.pidfds
            .retain(|pid, _| live.iter().any(|h| h.pid().as_raw() == *pid));
        for handle in live {
            self.pidfds
                .entry(handle.pid().as_raw())
                .or_insert_with(|| pidfd_open(handle.pid()));
        }
    }

    /// Poll captures and pidfds. Returns readiness for each capture, by index.
    fn wait_readable(&self, timeout: Duration) -> Result<Vec<bool>> {
        let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
        let mut fds: Vec<PollFd<'_>> = self
            .captures
            .iter()
            .map(|reader| PollFd::new(reader.as_fd(), PollFlags::POLLIN))
            .chain(
                self.pidfds
                    .values()
                    .flatten()
                    .map(|fd| PollFd::new(fd.as_fd(), PollFlags::POLLIN)),
            )
            .collect();

        match poll(&mut fds, millis) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(SpawnError::Syscall(format!("poll failed: {}", e))),
        }

        Ok(fds
            .iter()
            .take(self.captures.len())
            .map(|fd| fd.revents().is_some_and(|r| !r.is_empty()))
            .collect())
    }

    fn abandon(&mut self, registry: &ProcessRegistry, handle: &ProcessHandle) {
        self.pidfds.remove(&handle.pid().as_raw());
        registry.reap(handle.pid());
        handle.resolve_lost();
    }

    fn finish(&mut self, registry: &ProcessRegistry, handle: &ProcessHandle, status: ExitStatus) {
        self.pidfds.remove(&handle.pid().as_raw());
        if registry.reap(handle.pid()).is_none() {
            error!("reaped process {} was not registered", handle.pid());
        }
        if !handle.resolve(status) {
            error!("process {} resolved twice", handle.pid());
        }
    }
}

/// Reap `pid` if it has terminated
fn try_reap(pid: Pid) -> Result<Option<ExitStatus>> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status) => match ExitStatus::from_wait_status(status) {
                Some(decoded) => return Ok(Some(decoded)),
                None => return Ok(None),
            },
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                return Err(SpawnError::Syscall(format!(
                    "process {} is not a child of this process",
                    pid
                )));
            }
            Err(e) => return Err(SpawnError::Syscall(format!("waitpid failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::stream::pipe;
    use crate::test_support::serial_guard;
    use futures::FutureExt;
    use nix::unistd::{fork, ForkResult};
    use std::fs::File;
    use std::io::Write;

    fn fork_exit(code: i32, delay: Duration) -> Pid {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                std::thread::sleep(delay);
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => panic!("fork failed: {}", e),
        }
    }

    #[test]
    fn poll_on_empty_registry_returns_immediately() {
        let registry = ProcessRegistry::new();
        let mut notifier = CompletionNotifier::new();
        let start = Instant::now();
        assert!(notifier
            .poll(&registry, Duration::from_secs(5))
            .unwrap()
            .is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!notifier.has_work(&registry));
    }

    #[test]
    fn resolves_exit_code_and_prunes_registry() {
        let _guard = serial_guard();
        let registry = ProcessRegistry::new();
        let pid = fork_exit(42, Duration::ZERO);
        let handle = ProcessHandle::new(pid, "exit-42".to_string(), None);
        registry.register(handle.clone()).unwrap();

        let mut notifier = CompletionNotifier::new();
        let status = notifier
            .wait_blocking(&registry, &handle, Duration::from_millis(100))
            .unwrap();

        assert_eq!(status, ExitStatus::Exited(42));
        assert!(registry.is_empty());
    }

    #[test]
    fn resolves_in_termination_order() {
        let _guard = serial_guard();
        let registry = ProcessRegistry::new();
        let slow = ProcessHandle::new(
            fork_exit(1, Duration::from_millis(400)),
            "slow".to_string(),
            None,
        );
        let fast = ProcessHandle::new(fork_exit(2, Duration::ZERO), "fast".to_string(), None);
        registry.register(slow.clone()).unwrap();
        registry.register(fast.clone()).unwrap();

        let mut notifier = CompletionNotifier::new();
        let mut order = Vec::new();
        while !registry.is_empty() {
            for handle in notifier
                .poll(&registry, Duration::from_millis(50))
                .unwrap()
            {
                order.push(handle.label().to_string());
            }
        }
        assert_eq!(order, vec!["fast", "slow"]);
    }

    #[test]
    fn capture_resolves_at_eof() {
        let registry = ProcessRegistry::new();
        let mut notifier = CompletionNotifier::new();
        let (read, write) = pipe().unwrap();
        let capture = notifier.watch_output(read).unwrap();
        assert!(notifier.has_work(&registry));

        let mut writer = File::from(write);
        writer.write_all(b"chunk").unwrap();
        drop(writer);

        while notifier.pending_captures() > 0 {
            notifier.poll(&registry, Duration::from_millis(50)).unwrap();
        }
        assert_eq!(capture.now_or_never().unwrap().unwrap(), b"chunk");
    }

    #[test]
    fn drain_until_reports_timeout() {
        let _guard = serial_guard();
        let registry = ProcessRegistry::new();
        let handle = ProcessHandle::new(
            fork_exit(0, Duration::from_millis(500)),
            "sleeper".to_string(),
            None,
        );
        registry.register(handle.clone()).unwrap();

        let mut notifier = CompletionNotifier::new();
        let drained = notifier
            .drain_until(
                &registry,
                Instant::now() + Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .unwrap();
        assert!(!drained);

        let drained = notifier
            .drain_until(
                &registry,
                Instant::now() + Duration::from_secs(10),
                Duration::from_millis(50),
            )
            .unwrap();
        assert!(drained);
        assert_eq!(handle.status(), Some(ExitStatus::Exited(0)));
    }

    #[test]
    fn child_reaped_elsewhere_does_not_block_others() {
        let _guard = serial_guard();
        let registry = ProcessRegistry::new();

        let stolen_pid = fork_exit(0, Duration::ZERO);
        waitpid(stolen_pid, None).unwrap();
        let stolen = ProcessHandle::new(stolen_pid, "stolen".to_string(), None);
        let other = ProcessHandle::new(fork_exit(7, Duration::ZERO), "other".to_string(), None);
        registry.register(stolen.clone()).unwrap();
        registry.register(other.clone()).unwrap();

        let mut notifier = CompletionNotifier::new();
        let status = notifier
            .wait_blocking(&registry, &other, Duration::from_millis(50))
            .unwrap();

        assert_eq!(status, ExitStatus::Exited(7));
        assert_eq!(
            stolen.status(),
            Some(ExitStatus::Exited(crate::INTERNAL_FAILURE_CODE))
        );
        assert_eq!(stolen.failure(), Some(crate::ChildFailure::Lost));
        assert!(registry.is_empty());
    }
}
