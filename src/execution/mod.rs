//! Execution layer: spawning children and tracking their completion
//!
//! This module handles child creation and everything the child does before
//! it diverges, plus the handle the parent keeps for it.
//!
//! # Features
//!
//! - **Descriptor rebinding**: stdin/stdout/stderr and extra descriptors
//! - **Command variant**: fork + execve with a prepared image
//! - **Callback variant**: fork and run a closure, exiting with its status
//! - **Failure reporting**: internal child failures become a reserved exit
//!   code plus a failure stage
//!
//! # Examples
//!
//! ```ignore
//! use mergeproc::execution::{FdSource, SpawnRequest, Spawner};
//! use mergeproc::scheduler::ProcessRegistry;
//!
//! let registry = ProcessRegistry::new();
//! let (read, write) = mergeproc::execution::stream::pipe()?;
//! let handle = Spawner::spawn(
//!     SpawnRequest::callback("hello", |_| 0).fd(1, FdSource::Owned(write)),
//!     &registry,
//! )?;
//! ```

pub mod context;
pub mod fd;
pub mod handle;
pub mod request;
pub mod spawner;
pub mod stream;

pub use context::{ExecutionContext, OutputMode};
pub use fd::{FdMap, FdSource};
pub use handle::{
    ChildFailure, Completion, ExitStatus, ProcessHandle, ProcessState, INTERNAL_FAILURE_CODE,
};
pub use request::{ChildCallback, Divergence, SpawnRequest};
pub use spawner::Spawner;
pub use stream::{pipe, OutputCapture};
