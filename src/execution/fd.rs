//! Descriptor rebinding for child processes
//!
//! The caller describes which descriptor numbers the child should see and
//! where each one comes from. The parent turns that description into a
//! [`RebindPlan`] before forking, so the child only issues `fcntl`, `dup2`
//! and `close` calls and never allocates.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

use crate::errors::{Result, SpawnError};

/// Where a child descriptor comes from
#[derive(Debug)]
pub enum FdSource {
    /// Keep the parent's descriptor with the same number
    Inherit,
    /// `/dev/null`, opened read/write
    Null,
    /// A descriptor handed over to the child, typically one end of a pipe.
    /// The parent's copy is closed once the spawn call returns.
    Owned(OwnedFd),
    /// A descriptor that stays owned by the caller
    Raw(RawFd),
}

/// Mapping from child descriptor number to its source
#[derive(Debug)]
pub struct FdMap {
    entries: BTreeMap<RawFd, FdSource>,
}

impl Default for FdMap {
    /// stdin, stdout and stderr inherited from the parent
    fn default() -> Self {
        Self::inherit_std()
    }
}

impl FdMap {
    /// A map with no entries: every descriptor is closed in the child
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Inherit descriptors 0, 1 and 2
    pub fn inherit_std() -> Self {
        Self::empty()
            .with(0, FdSource::Inherit)
            .with(1, FdSource::Inherit)
            .with(2, FdSource::Inherit)
    }

    /// Builder-style insert
    pub fn with(mut self, target: RawFd, source: FdSource) -> Self {
        self.insert(target, source);
        self
    }

    /// Install `source` as `target`, replacing any previous entry
    pub fn insert(&mut self, target: RawFd, source: FdSource) -> Option<FdSource> {
        self.entries.insert(target, source)
    }

    /// Remove the entry for `target`, so the child sees it closed
    pub fn remove(&mut self, target: RawFd) -> Option<FdSource> {
        self.entries.remove(&target)
    }

    pub fn get(&self, target: RawFd) -> Option<&FdSource> {
        self.entries.get(&target)
    }

    /// Target descriptor numbers in ascending order
    pub fn targets(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.entries.keys().copied()
    }

    pub fn max_target(&self) -> Option<RawFd> {
        self.entries.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a rebind failed in the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebindError {
    pub target: RawFd,
    pub errno: Errno,
}

/// A rebind prepared in the parent and applied in the child.
///
/// Every buffer the child touches is sized here, before the fork.
#[derive(Debug)]
pub(crate) struct RebindPlan {
    /// (target, source) pairs
    moves: Vec<(RawFd, RawFd)>,
    /// Temporary copies of each source, filled in by the child
    scratch: Vec<RawFd>,
    /// Descriptors that survive the final sweep, ascending
    keep: Vec<RawFd>,
    /// Lowest descriptor number usable for temporary copies
    floor: RawFd,
    /// Upper bound for the close-loop fallback
    open_max: RawFd,
    _devnull: Option<OwnedFd>,
}

impl RebindPlan {
    /// Prepare the plan for `map`. `retain` lists extra descriptors that must
    /// stay open in the child (they must not collide with any target).
    pub(crate) fn prepare(map: &FdMap, retain: &[RawFd]) -> Result<Self> {
        let devnull = if map.entries.values().any(|s| matches!(s, FdSource::Null)) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/null")?;
            Some(OwnedFd::from(file))
        } else {
            None
        };

        let mut moves = Vec::with_capacity(map.len());
        for (&target, source) in &map.entries {
            if target < 0 {
                return Err(SpawnError::InvalidRequest(format!(
                    "negative descriptor number {}",
                    target
                )));
            }
            let source = match source {
                FdSource::Inherit => target,
                FdSource::Null => devnull.as_ref().map(AsRawFd::as_raw_fd).ok_or_else(|| {
                    SpawnError::Syscall("/dev/null was not opened".to_string())
                })?,
                FdSource::Owned(fd) => fd.as_raw_fd(),
                FdSource::Raw(fd) => *fd,
            };
            moves.push((target, source));
        }

        let mut keep: Vec<RawFd> = moves.iter().map(|&(target, _)| target).collect();
        for &fd in retain {
            if keep.contains(&fd) {
                return Err(SpawnError::InvalidRequest(format!(
                    "descriptor {} is reserved and cannot be a rebind target",
                    fd
                )));
            }
            keep.push(fd);
        }
        keep.sort_unstable();

        let highest = moves
            .iter()
            .flat_map(|&(target, source)| [target, source])
            .chain(retain.iter().copied())
            .max()
            .unwrap_or(2);

        let open_max = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
            n if n > 0 => n.min(RawFd::MAX as libc::c_long) as RawFd,
            _ => 1024,
        };

        Ok(Self {
            scratch: vec![-1; moves.len()],
            moves,
            keep,
            floor: highest + 1,
            open_max,
            _devnull: devnull,
        })
    }

    /// Apply the plan. Only called in a freshly forked child.
    pub(crate) fn apply(&mut self) -> std::result::Result<(), RebindError> {
        // Copy every source out of the way first so that installing one
        // target can never clobber a source that is still pending.
        for (slot, &(target, source)) in self.scratch.iter_mut().zip(self.moves.iter()) {
            let copy = unsafe { libc::fcntl(source, libc::F_DUPFD, self.floor) };
            if copy < 0 {
                return Err(RebindError {
                    target,
                    errno: Errno::last(),
                });
            }
            *slot = copy;
        }

        for (&copy, &(target, _)) in self.scratch.iter().zip(self.moves.iter()) {
            if unsafe { libc::dup2(copy, target) } < 0 {
                return Err(RebindError {
                    target,
                    errno: Errno::last(),
                });
            }
            unsafe { libc::close(copy) };
        }

        close_unretained(&self.keep, self.open_max);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn moves(&self) -> &[(RawFd, RawFd)] {
        &self.moves
    }

    #[cfg(test)]
    pub(crate) fn keep(&self) -> &[RawFd] {
        &self.keep
    }

    #[cfg(test)]
    pub(crate) fn floor(&self) -> RawFd {
        self.floor
    }
}

/// Close every descriptor not listed in `keep` (ascending).
fn close_unretained(keep: &[RawFd], open_max: RawFd) {
    let mut low: libc::c_uint = 0;
    for &fd in keep {
        let fd = fd as libc::c_uint;
        if fd > low {
            close_range(low, fd - 1, open_max);
        }
        low = fd.saturating_add(1);
    }
    close_range(low, libc::c_uint::MAX, open_max);
}

fn close_range(low: libc::c_uint, high: libc::c_uint, open_max: RawFd) {
    let ret = unsafe { libc::syscall(libc::SYS_close_range, low, high, 0 as libc::c_uint) };
    if ret == 0 {
        return;
    }

    // Kernels before 5.9 lack close_range(2)
    let high = high.min(open_max.max(0) as libc::c_uint);
    let mut fd = low;
    while fd <= high {
        unsafe { libc::close(fd as RawFd) };
        if fd == libc::c_uint::MAX {
            break;
        }
        fd += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_inherits_standard_streams() {
        let map = FdMap::default();
        assert_eq!(map.targets().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(matches!(map.get(1), Some(FdSource::Inherit)));
    }

    #[test]
    fn empty_map_has_no_targets() {
        let map = FdMap::empty();
        assert!(map.is_empty());
        assert_eq!(map.max_target(), None);
    }

    #[test]
    fn insert_replaces_existing_entry() {
        let mut map = FdMap::inherit_std();
        assert!(map.insert(1, FdSource::Null).is_some());
        assert!(matches!(map.get(1), Some(FdSource::Null)));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn remove_drops_entry() {
        let mut map = FdMap::inherit_std();
        map.remove(0);
        assert_eq!(map.targets().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn plan_resolves_inherit_to_same_number() {
        let map = FdMap::empty().with(2, FdSource::Inherit);
        let plan = RebindPlan::prepare(&map, &[]).unwrap();
        assert_eq!(plan.moves(), &[(2, 2)]);
    }

    #[test]
    fn plan_opens_devnull_once() {
        let map = FdMap::empty()
            .with(0, FdSource::Null)
            .with(1, FdSource::Null);
        let plan = RebindPlan::prepare(&map, &[]).unwrap();
        let sources: Vec<RawFd> = plan.moves().iter().map(|&(_, s)| s).collect();
        assert_eq!(sources[0], sources[1]);
        assert!(sources[0] >= 0);
    }

    #[test]
    fn plan_keeps_targets_and_retained_sorted() {
        let map = FdMap::empty()
            .with(5, FdSource::Raw(1))
            .with(1, FdSource::Inherit);
        let plan = RebindPlan::prepare(&map, &[9]).unwrap();
        assert_eq!(plan.keep(), &[1, 5, 9]);
        assert!(plan.floor() > 9);
    }

    #[test]
    fn plan_floor_is_above_every_source() {
        let (read, _write) = crate::execution::stream::pipe().unwrap();
        let raw = read.as_raw_fd();
        let map = FdMap::empty().with(0, FdSource::Owned(read));
        let plan = RebindPlan::prepare(&map, &[]).unwrap();
        assert!(plan.floor() > raw);
    }

    #[test]
    fn plan_rejects_retained_target_collision() {
        let map = FdMap::empty().with(7, FdSource::Null);
        let err = RebindPlan::prepare(&map, &[7]).unwrap_err();
        assert!(matches!(err, SpawnError::InvalidRequest(_)));
    }

    #[test]
    fn plan_rejects_negative_target() {
        let map = FdMap::empty().with(-1, FdSource::Inherit);
        assert!(RebindPlan::prepare(&map, &[]).is_err());
    }
}
