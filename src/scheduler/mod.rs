//! Scheduler integration: a single-threaded cooperative event loop
//!
//! Tasks are plain futures run on a [`LocalPool`]. The only suspension
//! points that involve children are [`ProcessHandle::wait`] and
//! [`OutputCapture`]; whenever every task is stalled the loop hands control
//! to the [`CompletionNotifier`], which blocks in `poll(2)` for at most the
//! configured interval.

pub mod notifier;
pub mod registry;

pub use notifier::CompletionNotifier;
pub use registry::ProcessRegistry;

use std::future::Future;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Instant;

use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;
use futures::FutureExt;
use log::{debug, info, warn};
use nix::sys::signal::Signal;

use crate::config::SchedulerConfig;
use crate::errors::{Result, SpawnError};
use crate::execution::stream::OutputCapture;
use crate::execution::{ProcessHandle, SpawnRequest, Spawner};

/// Owns the registry, the notifier and the task pool for one scheduler
/// lifetime. Dropping it shuts down every child that is still alive.
pub struct Scheduler {
    config: SchedulerConfig,
    pool: LocalPool,
    registry: Arc<ProcessRegistry>,
    notifier: CompletionNotifier,
    shut_down: bool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pool: LocalPool::new(),
            registry: Arc::new(ProcessRegistry::new()),
            notifier: CompletionNotifier::new(),
            shut_down: false,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The registry to pass to [`Spawner::spawn`] from inside tasks
    pub fn registry(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.registry)
    }

    /// Spawner for tasks that start further tasks
    pub fn spawner(&self) -> LocalSpawner {
        self.pool.spawner()
    }

    /// Start a child. Returns immediately.
    pub fn spawn(&self, request: SpawnRequest) -> Result<ProcessHandle> {
        Spawner::spawn(request, &self.registry)
    }

    /// Collect the output written to a pipe read end
    pub fn capture(&mut self, fd: OwnedFd) -> Result<OutputCapture> {
        self.notifier.watch_output(fd)
    }

    /// Queue a task on the loop
    pub fn spawn_local<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.pool
            .spawner()
            .spawn_local(future)
            .map_err(|e| SpawnError::Executor(e.to_string()))
    }

    /// Drive the loop until `future` completes.
    ///
    /// Fails with [`SpawnError::Stalled`] when the future is pending but no
    /// live child or capture is left that could wake it.
    pub fn run_until<F>(&mut self, future: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let mut remote = self
            .pool
            .spawner()
            .spawn_local_with_handle(future)
            .map_err(|e| SpawnError::Executor(e.to_string()))?;

        loop {
            self.pool.run_until_stalled();
            if let Some(output) = (&mut remote).now_or_never() {
                return Ok(output);
            }
            if !self.notifier.has_work(&self.registry) {
                return Err(SpawnError::Stalled);
            }
            self.notifier.poll(&self.registry, self.config.poll_interval)?;
        }
    }

    /// Drive queued tasks until no live child or capture remains
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.pool.run_until_stalled();
            if !self.notifier.has_work(&self.registry) {
                return Ok(());
            }
            self.notifier.poll(&self.registry, self.config.poll_interval)?;
        }
    }

    /// Resolve whatever is ready without blocking
    pub fn turn(&mut self) -> Result<Vec<ProcessHandle>> {
        self.pool.run_until_stalled();
        let resolved = self
            .notifier
            .poll(&self.registry, std::time::Duration::ZERO)?;
        self.pool.run_until_stalled();
        Ok(resolved)
    }

    /// Terminate every live child and reap it.
    ///
    /// Sends the configured shutdown signal, waits up to the grace period,
    /// then escalates to SIGKILL. Returns the handles that were live when
    /// shutdown began; all of them are resolved once it returns `Ok`.
    pub fn shutdown(&mut self) -> Result<Vec<ProcessHandle>> {
        self.shut_down = true;
        let live = self.registry.all_live();
        if live.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "shutting down {} live process(es) with {}",
            live.len(),
            self.config.shutdown_signal
        );
        self.registry.signal_all(self.config.shutdown_signal);

        let deadline = Instant::now() + self.config.shutdown_grace;
        let drained = self.notifier.drain_until(
            &self.registry,
            deadline,
            self.config.poll_interval,
        )?;

        if !drained {
            warn!(
                "{} process(es) survived {:?}, sending SIGKILL",
                self.registry.len(),
                self.config.shutdown_grace
            );
            self.registry.signal_all(Signal::SIGKILL);
            while !self.registry.is_empty() {
                self.notifier.poll(&self.registry, self.config.poll_interval)?;
            }
        }

        self.pool.run_until_stalled();
        debug!("shutdown complete");
        Ok(live)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.shut_down && self.registry.is_empty() {
            return;
        }
        if let Err(e) = self.shutdown() {
            warn!("scheduler shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerBuilder;
    use crate::execution::ExitStatus;
    use crate::test_support::serial_guard;
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        SchedulerBuilder::new()
            .poll_interval(Duration::from_millis(20))
            .shutdown_grace(Duration::from_millis(500))
            .build()
            .unwrap()
    }

    #[test]
    fn run_until_returns_ready_future() {
        let mut scheduler = scheduler();
        assert_eq!(scheduler.run_until(async { 7 }).unwrap(), 7);
    }

    #[test]
    fn run_until_reports_stall() {
        let mut scheduler = scheduler();
        let result = scheduler.run_until(futures::future::pending::<()>());
        assert!(matches!(result, Err(SpawnError::Stalled)));
    }

    #[test]
    fn run_until_awaits_child() {
        let _guard = serial_guard();
        let mut scheduler = scheduler();
        let handle = scheduler
            .spawn(SpawnRequest::callback("exit-3", |_| 3))
            .unwrap();

        let status = scheduler.run_until(handle.wait()).unwrap();
        assert_eq!(status, ExitStatus::Exited(3));
        assert!(scheduler.registry().is_empty());
    }

    #[test]
    fn tasks_spawn_children_through_shared_registry() {
        let _guard = serial_guard();
        let mut scheduler = scheduler();
        let registry = scheduler.registry();

        let statuses = scheduler
            .run_until(async move {
                let mut statuses = Vec::new();
                for code in [1, 2] {
                    let handle = Spawner::spawn(
                        SpawnRequest::callback(format!("exit-{}", code), move |_| code),
                        &registry,
                    )
                    .unwrap();
                    statuses.push(handle.wait().await);
                }
                statuses
            })
            .unwrap();

        assert_eq!(
            statuses,
            vec![ExitStatus::Exited(1), ExitStatus::Exited(2)]
        );
    }

    #[test]
    fn externally_reaped_child_does_not_stall_loop() {
        let _guard = serial_guard();
        let mut scheduler = scheduler();
        let first = scheduler
            .spawn(SpawnRequest::callback("reaped-elsewhere", |_| 0))
            .unwrap();
        nix::sys::wait::waitpid(first.pid(), None).unwrap();
        let second = scheduler
            .spawn(SpawnRequest::callback("exit-7", |_| 7))
            .unwrap();

        let status = scheduler.run_until(second.wait()).unwrap();
        assert_eq!(status, ExitStatus::Exited(7));
        assert_eq!(first.failure(), Some(crate::ChildFailure::Lost));
        assert!(scheduler.registry().is_empty());
    }

    #[test]
    fn run_drains_queued_tasks() {
        let _guard = serial_guard();
        let mut scheduler = scheduler();
        let handle = scheduler
            .spawn(SpawnRequest::callback("exit-0", |_| 0))
            .unwrap();
        let waiter = handle.clone();
        scheduler
            .spawn_local(async move {
                waiter.wait().await;
            })
            .unwrap();

        scheduler.run().unwrap();
        assert_eq!(handle.status(), Some(ExitStatus::Exited(0)));
    }

    #[test]
    fn shutdown_terminates_live_children() {
        let _guard = serial_guard();
        let mut scheduler = scheduler();
        let handle = scheduler
            .spawn(SpawnRequest::callback("sleeper", |_| {
                std::thread::sleep(Duration::from_secs(30));
                0
            }))
            .unwrap();

        let resolved = scheduler.shutdown().unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(
            handle.status(),
            Some(ExitStatus::Signaled(Signal::SIGTERM))
        );
        assert!(scheduler.registry().is_empty());
    }

    #[test]
    fn drop_reaps_children() {
        let _guard = serial_guard();
        let scheduler = scheduler();
        let registry = scheduler.registry();
        let handle = scheduler
            .spawn(SpawnRequest::callback("sleeper", |_| {
                std::thread::sleep(Duration::from_secs(30));
                0
            }))
            .unwrap();

        drop(scheduler);
        assert!(registry.is_empty());
        assert!(handle.is_finished());
    }
}
