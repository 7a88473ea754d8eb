//! Bookkeeping of live child processes

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use log::debug;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::errors::{Result, SpawnError};
use crate::execution::ProcessHandle;

/// Live children owned by one scheduler.
///
/// An identifier is present at most once: it is added when the spawner
/// creates the child and removed when the notifier reaps it, and the kernel
/// does not recycle a pid before it is reaped.
#[derive(Default)]
pub struct ProcessRegistry {
    live: Mutex<BTreeMap<i32, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<i32, ProcessHandle>> {
        self.live.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn register(&self, handle: ProcessHandle) -> Result<()> {
        let pid = handle.pid().as_raw();
        let mut live = self.entries();
        if live.contains_key(&pid) {
            return Err(SpawnError::DuplicatePid { pid });
        }
        live.insert(pid, handle);
        Ok(())
    }

    /// Remove and return the entry for `pid`
    pub fn reap(&self, pid: Pid) -> Option<ProcessHandle> {
        self.entries().remove(&pid.as_raw())
    }

    pub fn get(&self, pid: Pid) -> Option<ProcessHandle> {
        self.entries().get(&pid.as_raw()).cloned()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.entries().contains_key(&pid.as_raw())
    }

    /// Snapshot of every live handle, ordered by pid
    pub fn all_live(&self) -> Vec<ProcessHandle> {
        self.entries().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Send `signal` to every live child. Returns how many were signaled.
    pub fn signal_all(&self, signal: Signal) -> usize {
        let mut delivered = 0;
        for handle in self.all_live() {
            match handle.signal(signal) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("could not signal {}: {}", handle.pid(), e),
            }
        }
        delivered
    }
}
