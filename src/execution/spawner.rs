//! Fork-based spawning
//!
//! The spawner is the divergence point: it forks, registers the child in the
//! parent and returns at once, while the child rebinds its descriptors and
//! then either execs a program or runs a callback and exits with its status.
//!
//! Order of operations in the child:
//! 1. Rebind descriptors (nothing else runs on unrebound streams)
//! 2. Command: chdir, reset SIGPIPE, execve
//! 3. Callback: apply env/cwd and the execution context, run the callback
//!    under `catch_unwind`, flush, `_exit` with its status
//!
//! The callback child inherits only the forking thread. If another parent
//! thread holds the stdout or stderr lock at fork time, the final flush in
//! the child blocks forever; parents with such threads should use the
//! worker variant (`merge::worker_request`) instead.

use std::ffi::CString;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use log::{debug, error};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};

use crate::errors::{Result, SpawnError};
use crate::execution::context::ExecutionContext;
use crate::execution::fd::RebindPlan;
use crate::execution::handle::{ChildFailure, ProcessHandle, INTERNAL_FAILURE_CODE};
use crate::execution::request::{c_string, ChildCallback, Divergence, ExecImage, SpawnRequest};
use crate::execution::stream::{pipe, set_nonblocking};
use crate::scheduler::ProcessRegistry;

/// Child-side work, fully prepared before the fork
enum Prepared {
    Exec(ExecImage),
    Callback {
        callback: ChildCallback,
        setup: CallbackSetup,
    },
}

/// Environment and working directory for a callback child, as C strings.
///
/// Applied through libc in the child so that no std lock (the environment
/// lock in particular) held by another parent thread at fork time is taken.
struct CallbackSetup {
    clear_env: bool,
    env: Vec<(CString, CString)>,
    cwd: Option<CString>,
}

impl CallbackSetup {
    fn prepare(
        env: Vec<(String, String)>,
        inherit_env: bool,
        cwd: Option<&Path>,
    ) -> Result<Self> {
        let env = env
            .into_iter()
            .map(|(key, value)| -> Result<(CString, CString)> {
                if key.is_empty() || key.contains('=') {
                    return Err(SpawnError::InvalidRequest(format!(
                        "invalid environment variable name {:?}",
                        key
                    )));
                }
                Ok((
                    c_string(key, "environment name")?,
                    c_string(value, "environment value")?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let cwd = cwd
            .map(|dir| c_string(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;
        Ok(Self {
            clear_env: !inherit_env,
            env,
            cwd,
        })
    }

    /// Child-side only
    fn apply(&self) -> std::result::Result<(), ChildFailure> {
        unsafe {
            if self.clear_env && libc::clearenv() != 0 {
                return Err(ChildFailure::Setup);
            }
            for (key, value) in &self.env {
                if libc::setenv(key.as_ptr(), value.as_ptr(), 1) != 0 {
                    return Err(ChildFailure::Setup);
                }
            }
            if let Some(dir) = &self.cwd {
                if libc::chdir(dir.as_ptr()) != 0 {
                    return Err(ChildFailure::Setup);
                }
            }
        }
        Ok(())
    }
}

/// Creates child processes
pub struct Spawner;

impl Spawner {
    /// Start the child described by `request` and record it in `registry`.
    ///
    /// Never waits for the child. Errors are creation failures only;
    /// anything that goes wrong after the fork is reported through the
    /// handle's status.
    pub fn spawn(request: SpawnRequest, registry: &ProcessRegistry) -> Result<ProcessHandle> {
        let SpawnRequest {
            label,
            divergence,
            fds,
            env,
            inherit_env,
            cwd,
            color,
        } = request;

        let (report_read, report_write) = report_pipe(fds.max_target().unwrap_or(2) + 1)?;
        let mut plan = RebindPlan::prepare(&fds, &[report_write.as_raw_fd()])?;

        let prepared = match divergence {
            Divergence::Command { program, args } => Prepared::Exec(ExecImage::prepare(
                &program,
                &args,
                env,
                inherit_env,
                cwd.as_deref(),
            )?),
            Divergence::Callback(callback) => Prepared::Callback {
                callback,
                setup: CallbackSetup::prepare(env, inherit_env, cwd.as_deref())?,
            },
        };
        let context = ExecutionContext::direct(color);

        // Buffered parent output would otherwise be lost or written twice
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                // The child holds its own copies now
                drop(report_write);
                drop(plan);
                drop(fds);

                debug!("spawned process {} ({})", child, label);
                let handle = ProcessHandle::new(child, label, Some(report_read));
                if let Err(e) = registry.register(handle.clone()) {
                    error!("failed to register process {}: {}", child, e);
                    let _ = kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                    return Err(e);
                }
                Ok(handle)
            }
            Ok(ForkResult::Child) => {
                let code = diverge(&mut plan, prepared, context, report_write.as_raw_fd());
                unsafe { libc::_exit(code) }
            }
            Err(errno) => Err(SpawnError::Fork(errno)),
        }
    }
}

/// Close-on-exec pipe whose write end sits at or above `min_fd`, so it can
/// never be a rebind target.
fn report_pipe(min_fd: RawFd) -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe()?;
    set_nonblocking(read.as_fd())?;
    let moved = Errno::result(unsafe {
        libc::fcntl(write.as_raw_fd(), libc::F_DUPFD_CLOEXEC, min_fd.max(3))
    })
    .map_err(|e| SpawnError::Syscall(format!("F_DUPFD_CLOEXEC failed: {}", e)))?;
    drop(write);
    Ok((read, unsafe { OwnedFd::from_raw_fd(moved) }))
}

/// Runs in the child only. Returns the exit code unless exec succeeds.
fn diverge(
    plan: &mut RebindPlan,
    prepared: Prepared,
    context: ExecutionContext,
    report: RawFd,
) -> i32 {
    if plan.apply().is_err() {
        return fail(report, ChildFailure::Rebind);
    }

    match prepared {
        Prepared::Exec(image) => {
            let failure = image.exec();
            fail(report, failure)
        }
        Prepared::Callback { callback, setup } => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
                run_callback(callback, &setup, context)
            }));
            let _ = std::io::stdout().flush();
            let _ = std::io::stderr().flush();

            match outcome {
                Ok(Ok(code)) if (0..=255).contains(&code) => code,
                Ok(Ok(_)) => fail(report, ChildFailure::InvalidStatus),
                Ok(Err(failure)) => fail(report, failure),
                Err(_) => fail(report, ChildFailure::Callback),
            }
        }
    }
}

fn run_callback(
    callback: ChildCallback,
    setup: &CallbackSetup,
    context: ExecutionContext,
) -> std::result::Result<i32, ChildFailure> {
    setup.apply()?;
    context.apply();
    Ok(callback(&context))
}

fn fail(report: RawFd, failure: ChildFailure) -> i32 {
    let byte = [failure.as_byte()];
    unsafe { libc::write(report, byte.as_ptr() as *const libc::c_void, 1) };
    INTERNAL_FAILURE_CODE
}
