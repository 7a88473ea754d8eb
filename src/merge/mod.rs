//! Running a file-tree merge in an isolated child
//!
//! The merge itself belongs to a collaborator ([`MergeCollaborator`]); this
//! module only moves a [`MergeJob`] into a child and reports the status back.
//! Two launch styles exist:
//!
//! - [`request`]: fork and run the collaborator in the forked child, which
//!   reuses whatever the parent already loaded
//! - [`worker_request`]: serialize the job to a temp file and run the
//!   `mergeproc-worker` binary on it, which is safe even when the parent
//!   runs other threads

pub mod tree;
pub mod worker;

pub use tree::CopyMerge;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::errors::{Result, SpawnError};
use crate::execution::{
    Completion, ExecutionContext, ExitStatus, FdMap, ProcessHandle, SpawnRequest, Spawner,
};
use crate::scheduler::ProcessRegistry;

/// Everything a collaborator needs to perform one merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeJob {
    pub srcroot: PathBuf,
    pub destroot: PathBuf,
    /// Per-file configuration, opaque to this crate
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Persisted content-fingerprints file
    pub aux_file: PathBuf,
    /// Minimal settings subset the child needs (e.g. `NOCOLOR`)
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl MergeJob {
    pub fn new(
        srcroot: impl Into<PathBuf>,
        destroot: impl Into<PathBuf>,
        aux_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            srcroot: srcroot.into(),
            destroot: destroot.into(),
            config: BTreeMap::new(),
            aux_file: aux_file.into(),
            settings: BTreeMap::new(),
        }
    }

    pub fn config_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Whether the child should emit colored output
    pub fn color(&self) -> bool {
        ExecutionContext::color_from_settings(&self.settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Write the job to a fresh temp file. The file is removed on drop.
    pub fn to_tempfile(&self) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("mergeproc-job-")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer(&mut file, self)?;
        file.flush()?;
        Ok(file)
    }

    fn label(&self) -> String {
        format!("merge {}", self.destroot.display())
    }
}

/// The merge operation, invoked synchronously inside the child.
///
/// The return value becomes the child's exit status and must lie in
/// `0..=255`.
pub trait MergeCollaborator {
    fn perform(&self, job: &MergeJob, context: &ExecutionContext) -> i32;
}

impl<F> MergeCollaborator for F
where
    F: Fn(&MergeJob, &ExecutionContext) -> i32,
{
    fn perform(&self, job: &MergeJob, context: &ExecutionContext) -> i32 {
        self(job, context)
    }
}

/// Callback request that runs `collaborator` on `job` in a forked child
pub fn request<C>(job: MergeJob, collaborator: C) -> SpawnRequest
where
    C: MergeCollaborator + 'static,
{
    let color = job.color();
    SpawnRequest::callback(job.label(), move |context| {
        collaborator.perform(&job, context)
    })
    .color(color)
}

/// Command request that runs the worker binary `program` on `job`.
///
/// The returned temp file holds the serialized job and must outlive the
/// child.
pub fn worker_request(
    job: &MergeJob,
    program: impl Into<String>,
) -> Result<(SpawnRequest, NamedTempFile)> {
    let file = job.to_tempfile()?;
    let path = file
        .path()
        .to_str()
        .ok_or_else(|| SpawnError::InvalidRequest("job file path is not UTF-8".to_string()))?
        .to_string();
    debug!("merge job for {} written to {}", job.destroot.display(), path);

    let request = SpawnRequest::command(program, ["--job".to_string(), path]).label(job.label());
    Ok((request, file))
}

/// Lifecycle of a [`MergeTask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Finished(ExitStatus),
}

enum Launch {
    Callback(SpawnRequest),
    Worker(String),
}

/// The logical task owning one merge
pub struct MergeTask {
    job: MergeJob,
    launch: Option<Launch>,
    fds: Option<FdMap>,
    handle: Option<ProcessHandle>,
    job_file: Option<NamedTempFile>,
}

impl MergeTask {
    /// Merge in a forked child running `collaborator`
    pub fn callback<C>(job: MergeJob, collaborator: C) -> Self
    where
        C: MergeCollaborator + 'static,
    {
        let request = request(job.clone(), collaborator);
        Self::with_launch(job, Launch::Callback(request))
    }

    /// Merge in a separate worker binary
    pub fn worker(job: MergeJob, program: impl Into<String>) -> Self {
        Self::with_launch(job, Launch::Worker(program.into()))
    }

    fn with_launch(job: MergeJob, launch: Launch) -> Self {
        Self {
            job,
            launch: Some(launch),
            fds: None,
            handle: None,
            job_file: None,
        }
    }

    /// Descriptor map for the child (defaults to inheriting 0, 1 and 2)
    pub fn fds(mut self, fds: FdMap) -> Self {
        self.fds = Some(fds);
        self
    }

    pub fn job(&self) -> &MergeJob {
        &self.job
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    pub fn state(&self) -> TaskState {
        match &self.handle {
            None => TaskState::Pending,
            Some(handle) => match handle.status() {
                Some(status) => TaskState::Finished(status),
                None => TaskState::Running,
            },
        }
    }

    /// Spawn the child. Returns without waiting for it.
    pub fn start(&mut self, registry: &ProcessRegistry) -> Result<ProcessHandle> {
        let launch = self
            .launch
            .take()
            .ok_or_else(|| SpawnError::InvalidRequest("merge task already started".to_string()))?;

        let mut request = match launch {
            Launch::Callback(request) => request,
            Launch::Worker(program) => {
                let (request, file) = worker_request(&self.job, program)?;
                self.job_file = Some(file);
                request
            }
        };
        if let Some(fds) = self.fds.take() {
            request = request.fds(fds);
        }

        let handle = Spawner::spawn(request, registry)?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Future resolving with the child's status
    pub fn wait(&self) -> Result<Completion> {
        self.handle
            .as_ref()
            .map(ProcessHandle::wait)
            .ok_or(SpawnError::NotStarted)
    }
}
