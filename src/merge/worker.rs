//! Entry point of the dedicated merge worker process

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use log::{debug, error};

use super::{MergeCollaborator, MergeJob};
use crate::execution::{ExecutionContext, INTERNAL_FAILURE_CODE};

/// Load the job at `path` and run `collaborator` on it in direct mode.
///
/// Returns the exit status for the process: the collaborator's own status,
/// or [`INTERNAL_FAILURE_CODE`] if the job cannot be loaded, the collaborator
/// panics or it returns a status outside `0..=255`.
pub fn run<C>(path: &Path, collaborator: &C) -> i32
where
    C: MergeCollaborator + ?Sized,
{
    let job = match MergeJob::load(path) {
        Ok(job) => job,
        Err(e) => {
            error!("cannot load merge job {}: {}", path.display(), e);
            return INTERNAL_FAILURE_CODE;
        }
    };
    debug!(
        "merging {} into {}",
        job.srcroot.display(),
        job.destroot.display()
    );

    let context = ExecutionContext::direct(job.color());
    context.apply();

    let code = match panic::catch_unwind(AssertUnwindSafe(|| {
        collaborator.perform(&job, &context)
    })) {
        Ok(code) if (0..=255).contains(&code) => code,
        Ok(code) => {
            error!("merge returned out-of-range status {}", code);
            INTERNAL_FAILURE_CODE
        }
        Err(_) => {
            error!("merge into {} panicked", job.destroot.display());
            INTERNAL_FAILURE_CODE
        }
    };

    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved_job() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        MergeJob::new("/src", "/dst", "/aux")
            .setting("NOCOLOR", "true")
            .save(&path)
            .unwrap();
        (dir, path)
    }

    #[test]
    fn returns_collaborator_status() {
        let (_dir, path) = saved_job();
        let code = run(&path, &|job: &MergeJob, context: &ExecutionContext| {
            if job.destroot == Path::new("/dst") && context.is_direct() && !context.color {
                12
            } else {
                1
            }
        });
        assert_eq!(code, 12);
    }

    #[test]
    fn unreadable_job_is_internal_failure() {
        let code = run(
            Path::new("/nonexistent/job.json"),
            &|_: &MergeJob, _: &ExecutionContext| 0,
        );
        assert_eq!(code, INTERNAL_FAILURE_CODE);
    }

    #[test]
    fn panic_and_range_errors_are_internal_failures() {
        let (_dir, path) = saved_job();
        let panics = run(&path, &|_: &MergeJob, _: &ExecutionContext| -> i32 {
            panic!("collaborator bug")
        });
        assert_eq!(panics, INTERNAL_FAILURE_CODE);

        let too_big = run(&path, &|_: &MergeJob, _: &ExecutionContext| 1000);
        assert_eq!(too_big, INTERNAL_FAILURE_CODE);
    }
}
