//! mergeproc: fork-based child execution for a single-threaded scheduler
//!
//! Launches units of work as isolated child processes, either an external
//! command or an in-process callback, without blocking the scheduler thread,
//! and reports their completion through one uniform handle.
//!
//! # Modules
//!
//! - **execution**: Descriptor rebinding, the spawner and process handles
//! - **scheduler**: Process registry, completion notifier and event loop
//! - **merge**: Running a file-tree merge in a child (callback or worker)
//! - **config**: Scheduler configuration and builder
//! - **logging**: Logger setup for binaries
//!
//! # Example
//!
//! ```ignore
//! use mergeproc::{FdSource, SchedulerBuilder, SpawnRequest};
//!
//! let mut scheduler = SchedulerBuilder::new().build()?;
//! let (read, write) = mergeproc::execution::pipe()?;
//! let output = scheduler.capture(read)?;
//! let handle = scheduler.spawn(
//!     SpawnRequest::callback("hello", |_| {
//!         println!("ok");
//!         0
//!     })
//!     .fd(1, FdSource::Owned(write)),
//! )?;
//!
//! let status = scheduler.run_until(handle.wait())?;
//! println!("Exit code: {:?}", status.code());
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod logging;

// Layered modules
pub mod execution;
pub mod scheduler;

// Collaborator seam
pub mod merge;

// Public API
pub use config::{SchedulerBuilder, SchedulerConfig};
pub use errors::{Result, SpawnError};
pub use execution::{
    ChildFailure, ExecutionContext, ExitStatus, FdMap, FdSource, OutputCapture, OutputMode,
    ProcessHandle, ProcessState, SpawnRequest, Spawner, INTERNAL_FAILURE_CODE,
};
pub use merge::{CopyMerge, MergeCollaborator, MergeJob, MergeTask, TaskState};
pub use scheduler::{CompletionNotifier, ProcessRegistry, Scheduler};

#[cfg(test)]
mod tests {
    use crate::{SchedulerBuilder, SpawnRequest};

    #[test]
    fn test_module_imports() {
        let _builder = SchedulerBuilder::new();
        let _request = SpawnRequest::callback("noop", |_| 0);
    }
}
