use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::tree_clock::{ProcessPath, Tid, TreeClock};

/// Global wall clock: the merged view of the latest known tick (and the TID
/// that produced it) per process identity. Built by update-merging the times
/// of all operations committed to the journal.
///
/// Lookup falls back to the longest ancestor prefix: a forked process
/// inherits its parent's pre-fork history until it produces an operation of
/// its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gwc {
    latest: HashMap<ProcessPath, (u64, Tid)>,
}

impl Gwc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation time: the source process has now reached
    /// `time.ticks()` with transaction `tid`.
    pub fn observe(&mut self, time: &TreeClock, tid: Tid) {
        let path = time.process_path();
        let ticks = time.ticks();
        match self.latest.get(&path) {
            Some((seen, _)) if *seen >= ticks => {}
            _ => {
                self.latest.insert(path, (ticks, tid));
            }
        }
    }

    /// Last seen tick of the process owning `time`, by exact path or the
    /// longest observed ancestor.
    pub fn get_ticks(&self, time: &TreeClock) -> u64 {
        self.prev_for_path(&time.process_path())
            .map(|(ticks, _)| ticks)
            .unwrap_or(0)
    }

    /// The `(tick, tid)` that precedes a new operation from `time`'s
    /// process. `None` if no ancestor has ever been observed (the process
    /// chain starts at genesis).
    pub fn prev(&self, time: &TreeClock) -> Option<(u64, Tid)> {
        self.prev_for_path(&time.process_path())
    }

    fn prev_for_path(&self, path: &ProcessPath) -> Option<(u64, Tid)> {
        let mut probe = Some(path.clone());
        while let Some(p) = probe {
            if let Some((ticks, tid)) = self.latest.get(&p) {
                return Some((*ticks, tid.clone()));
            }
            probe = p.parent();
        }
        None
    }

    /// True iff an operation at `time` is already fully reflected here:
    /// its source has been seen at or beyond `time.ticks()`.
    pub fn is_reflected(&self, time: &TreeClock) -> bool {
        time.ticks() <= self.get_ticks(time)
    }

    /// True iff `tid` is the latest transaction of any known process.
    pub fn contains_tid(&self, tid: &Tid) -> bool {
        self.latest.values().any(|(_, t)| t == tid)
    }

    /// True iff some process here is ahead of `time`: replaying from this
    /// point would skip events the holder of `time` has not seen.
    pub fn any_ticks_gt(&self, time: &TreeClock) -> bool {
        self.latest
            .iter()
            .any(|(path, (ticks, _))| *ticks > time.ticks_along(path))
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// The latest `(path, tick, tid)` triple per known process.
    pub fn entries(&self) -> impl Iterator<Item = (&ProcessPath, u64, &Tid)> {
        self.latest
            .iter()
            .map(|(path, (ticks, tid))| (path, *ticks, tid))
    }
}
