//! Reference collaborator: a plain recursive copy

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs as unix_fs;
use std::path::Path;

use console::style;
use log::{error, info};

use super::{MergeCollaborator, MergeJob};
use crate::execution::ExecutionContext;

/// Copies `srcroot` into `destroot`: directories, regular files (with their
/// permissions) and symlinks. Existing files are replaced.
///
/// Every merged entry is announced as `>>> <dest path>`, printed to stdout in
/// direct mode and logged otherwise. `config` and `aux_file` are carried but
/// not interpreted.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyMerge;

impl CopyMerge {
    /// Merge the tree and return the number of entries merged
    pub fn merge(&self, job: &MergeJob, context: &ExecutionContext) -> io::Result<usize> {
        let meta = fs::metadata(&job.srcroot)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", job.srcroot.display()),
            ));
        }
        fs::create_dir_all(&job.destroot)?;

        let mut merged = 0;
        self.merge_dir(&job.srcroot, &job.destroot, context, &mut merged)?;
        Ok(merged)
    }

    fn merge_dir(
        &self,
        src: &Path,
        dest: &Path,
        context: &ExecutionContext,
        merged: &mut usize,
    ) -> io::Result<()> {
        let mut entries = fs::read_dir(src)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let from = entry.path();
            let to = dest.join(entry.file_name());
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                fs::create_dir_all(&to)?;
                fs::set_permissions(&to, entry.metadata()?.permissions())?;
                announce(context, &to)?;
                *merged += 1;
                self.merge_dir(&from, &to, context, merged)?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(&from)?;
                if fs::symlink_metadata(&to).is_ok() {
                    fs::remove_file(&to)?;
                }
                unix_fs::symlink(&target, &to)?;
                announce(context, &to)?;
                *merged += 1;
            } else if file_type.is_file() {
                if fs::symlink_metadata(&to).is_ok_and(|m| m.file_type().is_symlink()) {
                    fs::remove_file(&to)?;
                }
                fs::copy(&from, &to)?;
                announce(context, &to)?;
                *merged += 1;
            }
        }
        Ok(())
    }
}

fn announce(context: &ExecutionContext, path: &Path) -> io::Result<()> {
    if context.is_direct() {
        let mut out = io::stdout().lock();
        writeln!(out, "{} {}", style(">>>").green(), path.display())?;
        out.flush()
    } else {
        info!(">>> {}", path.display());
        Ok(())
    }
}

impl MergeCollaborator for CopyMerge {
    fn perform(&self, job: &MergeJob, context: &ExecutionContext) -> i32 {
        match self.merge(job, context) {
            Ok(_) => 0,
            Err(e) => {
                if context.is_direct() {
                    let _ = writeln!(
                        io::stderr(),
                        "{} merge into {} failed: {}",
                        style("!!!").red().bold(),
                        job.destroot.display(),
                        e
                    );
                } else {
                    error!("merge into {} failed: {}", job.destroot.display(), e);
                }
                1
            }
        }
    }
}
