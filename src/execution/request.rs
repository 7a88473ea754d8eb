//! Spawn requests and the pre-fork preparation of an exec image

use std::ffi::CString;
use std::fmt;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};

use crate::errors::{Result, SpawnError};
use crate::execution::context::ExecutionContext;
use crate::execution::fd::{FdMap, FdSource};
use crate::execution::handle::ChildFailure;

/// Work run inside a forked child; its return value is the exit status.
pub type ChildCallback = Box<dyn FnOnce(&ExecutionContext) -> i32>;

/// What the child does after its descriptors are rebound
pub enum Divergence {
    /// Replace the process image
    Command { program: String, args: Vec<String> },
    /// Run in the forked image and exit with the returned status
    Callback(ChildCallback),
}

impl fmt::Debug for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::Command { program, args } => f
                .debug_struct("Command")
                .field("program", program)
                .field("args", args)
                .finish(),
            Divergence::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Everything needed to start one child
#[derive(Debug)]
pub struct SpawnRequest {
    pub(crate) label: String,
    pub(crate) divergence: Divergence,
    pub(crate) fds: FdMap,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) inherit_env: bool,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) color: bool,
}

impl SpawnRequest {
    fn new(label: String, divergence: Divergence) -> Self {
        Self {
            label,
            divergence,
            fds: FdMap::default(),
            env: Vec::new(),
            inherit_env: true,
            cwd: None,
            color: true,
        }
    }

    /// Run an external program
    pub fn command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        let args = args.into_iter().map(Into::into).collect();
        Self::new(program.clone(), Divergence::Command { program, args })
    }

    /// Run `callback` in a forked copy of this process.
    ///
    /// Only the calling thread exists in the child. The callback must not
    /// rely on locks another thread could have held at fork time.
    pub fn callback<F>(label: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce(&ExecutionContext) -> i32 + 'static,
    {
        Self::new(label.into(), Divergence::Callback(Box::new(callback)))
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Install `source` as descriptor `target` in the child
    pub fn fd(mut self, target: RawFd, source: FdSource) -> Self {
        self.fds.insert(target, source);
        self
    }

    /// Replace the whole descriptor map
    pub fn fds(mut self, fds: FdMap) -> Self {
        self.fds = fds;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Whether the child starts from the parent's environment (default) or
    /// only from the explicit overrides
    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Terminal styling inside the child
    pub fn color(mut self, enabled: bool) -> Self {
        self.color = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.label
    }

    pub fn is_callback(&self) -> bool {
        matches!(self.divergence, Divergence::Callback(_))
    }

    pub fn fd_map(&self) -> &FdMap {
        &self.fds
    }
}

/// Merge the parent environment with `overrides` (later entries win).
pub(crate) fn build_environment(
    overrides: Vec<(String, String)>,
    inherit: bool,
) -> Vec<(String, String)> {
    let mut combined: Vec<(String, String)> = if inherit {
        std::env::vars().collect()
    } else {
        Vec::new()
    };

    for (key, value) in overrides {
        if let Some((_, existing)) = combined.iter_mut().find(|(k, _)| k == &key) {
            *existing = value;
        } else {
            combined.push((key, value));
        }
    }

    combined
}

/// Resolve a program name to a path using PATH semantics.
pub(crate) fn resolve_program_path(program: &str, env: &[(String, String)]) -> Result<String> {
    if program.is_empty() {
        return Err(SpawnError::InvalidRequest("empty program name".to_string()));
    }
    if program.contains('/') {
        return Ok(program.to_string());
    }

    const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
    let path_value = env
        .iter()
        .find(|(key, _)| key == "PATH")
        .map(|(_, value)| value.as_str())
        .unwrap_or(DEFAULT_PATH);

    for entry in path_value.split(':') {
        let dir = if entry.is_empty() { "." } else { entry };
        let candidate = Path::new(dir).join(program);

        if access(&candidate, AccessFlags::X_OK).is_ok() {
            return Ok(candidate.to_string_lossy().into_owned());
        }
    }

    Err(SpawnError::InvalidRequest(format!(
        "command not found: {}",
        program
    )))
}

pub(crate) fn c_string(value: impl Into<Vec<u8>>, what: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| SpawnError::InvalidRequest(format!("{} contains a nul byte", what)))
}

/// A program image ready for `execve`, built before the fork so the child
/// does not allocate.
pub(crate) struct ExecImage {
    path: CString,
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    cwd: Option<CString>,
}

impl ExecImage {
    pub(crate) fn prepare(
        program: &str,
        args: &[String],
        env: Vec<(String, String)>,
        inherit_env: bool,
        cwd: Option<&Path>,
    ) -> Result<Self> {
        let env = build_environment(env, inherit_env);
        let path = c_string(resolve_program_path(program, &env)?, "program path")?;

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(c_string(program, "program name")?);
        for arg in args {
            argv.push(c_string(arg.as_str(), "argument")?);
        }

        let envp = env
            .iter()
            .map(|(k, v)| c_string(format!("{}={}", k, v), "environment entry"))
            .collect::<Result<Vec<_>>>()?;

        let cwd = cwd
            .map(|dir| c_string(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;

        // The CString buffers live on the heap, so these pointers stay valid
        // when the vectors are moved into the struct.
        let argv_ptrs = argv
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp_ptrs = envp
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            path,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
            cwd,
        })
    }

    /// Replace the process image. Returns only on failure.
    pub(crate) fn exec(&self) -> ChildFailure {
        if let Some(dir) = &self.cwd {
            if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
                return ChildFailure::Setup;
            }
        }

        unsafe {
            // Rust ignores SIGPIPE at startup; programs expect the default.
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            libc::execve(
                self.path.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            );
        }
        ChildFailure::Exec
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &CString {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn argc(&self) -> usize {
        self.argv_ptrs.len() - 1
    }
}
