//! Per-inode reservation windows.
//!
//! A window is a claim on a range of free blocks just past an inode's most
//! recent allocation. Sequential writers keep landing inside their own
//! window, so consecutive logical blocks get consecutive physical blocks
//! without rescanning the group bitmap. Windows are advisory: bits inside
//! a window stay free on disk, and the window evaporates on truncate,
//! close, or transaction abort.
//!
//! All windows live in one ordered map keyed by start block under a single
//! mutex. Operations are point queries plus a bounded overlap sweep and
//! never touch storage while the lock is held.

use jext_types::InodeNumber;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Width of a freshly created window, in blocks.
pub const DEFAULT_RESERVE_BLOCKS: u32 = 8;
/// Cap on window growth.
pub const MAX_RESERVE_BLOCKS: u32 = 1027;

#[derive(Debug, Clone, Copy)]
struct Window {
    start: u64,
    end: u64,
    ino: InodeNumber,
}

/// Per-inode allocation pattern state. Survives window eviction so a
/// streaming writer keeps its grown goal size.
#[derive(Debug, Clone, Copy)]
struct InodeRsv {
    window_start: Option<u64>,
    goal_size: u32,
    hits: u32,
    last_logical: u64,
    last_physical: u64,
}

#[derive(Debug, Default)]
struct TreeInner {
    windows: BTreeMap<u64, Window>,
    by_ino: HashMap<InodeNumber, InodeRsv>,
}

impl TreeInner {
    /// Keys of windows overlapping `[lo, hi)`, ascending. Windows are
    /// disjoint, so a reverse walk from `hi` stops at the first window
    /// ending at or before `lo`.
    fn overlapping(&self, lo: u64, hi: u64) -> Vec<u64> {
        let mut keys = Vec::new();
        for (&key, window) in self.windows.range(..hi).rev() {
            if window.end <= lo {
                break;
            }
            keys.push(key);
        }
        keys.reverse();
        keys
    }
}

/// All reservation windows of one mounted filesystem.
#[derive(Debug)]
pub struct ReservationTree {
    inner: Mutex<TreeInner>,
    default_goal: u32,
}

impl Default for ReservationTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationTree {
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_goal(DEFAULT_RESERVE_BLOCKS)
    }

    /// A tree whose fresh windows start at `goal` blocks instead of
    /// [`DEFAULT_RESERVE_BLOCKS`]. Clamped to `1..=MAX_RESERVE_BLOCKS`.
    #[must_use]
    pub fn with_default_goal(goal: u32) -> Self {
        Self {
            inner: Mutex::new(TreeInner::default()),
            default_goal: goal.clamp(1, MAX_RESERVE_BLOCKS),
        }
    }

    /// Current window of `ino` as `[start, end)`, if one is placed.
    #[must_use]
    pub fn window_of(&self, ino: InodeNumber) -> Option<(u64, u64)> {
        let inner = self.inner.lock();
        let start = inner.by_ino.get(&ino)?.window_start?;
        inner.windows.get(&start).map(|w| (w.start, w.end))
    }

    /// Last `(logical, physical)` block pair allocated for `ino`.
    #[must_use]
    pub fn last_alloc(&self, ino: InodeNumber) -> Option<(u64, u64)> {
        self.inner
            .lock()
            .by_ino
            .get(&ino)
            .map(|rsv| (rsv.last_logical, rsv.last_physical))
    }

    /// Window hits recorded for `ino`.
    #[must_use]
    pub fn hits_of(&self, ino: InodeNumber) -> u32 {
        self.inner.lock().by_ino.get(&ino).map_or(0, |rsv| rsv.hits)
    }

    /// Record a successful allocation of `[alloc_start, alloc_start+len)`
    /// backing logical block `logical` and reposition the inode's window
    /// just past it, clamped to `limit` (the end of the allocation's
    /// group). A hit, meaning the allocation landed inside the previous
    /// window or continued exactly where the last one stopped, doubles the
    /// goal size; a miss halves it back toward the default.
    pub fn record_alloc(
        &self,
        ino: InodeNumber,
        logical: u64,
        alloc_start: u64,
        alloc_len: u32,
        limit: u64,
    ) {
        if alloc_len == 0 {
            return;
        }
        let alloc_end = alloc_start + u64::from(alloc_len);
        let mut inner = self.inner.lock();

        let prev = inner.by_ino.get(&ino).copied();
        let mut goal_size = self.default_goal;
        let mut hits = 0_u32;
        let mut hit = false;
        if let Some(rsv) = prev {
            let inside = match rsv.window_start.and_then(|k| inner.windows.get(&k)) {
                Some(w) => alloc_start >= w.start && alloc_start < w.end,
                None => false,
            };
            let sequential = logical == rsv.last_logical.wrapping_add(1)
                && alloc_start == rsv.last_physical.wrapping_add(1);
            hit = inside || sequential;
            goal_size = if hit {
                rsv.goal_size.saturating_mul(2).min(MAX_RESERVE_BLOCKS)
            } else {
                (rsv.goal_size / 2).max(self.default_goal)
            };
            hits = if hit { rsv.hits + 1 } else { rsv.hits };
        }

        if let Some(key) = prev.and_then(|rsv| rsv.window_start) {
            inner.windows.remove(&key);
        }

        let start = alloc_end;
        let end = start.saturating_add(u64::from(goal_size)).min(limit);
        let window_start = if start < end {
            // The repositioned window is by construction the youngest, so
            // any overlap resolves against the older incumbent.
            Self::displace(&mut inner, ino, start, end);
            inner.windows.insert(start, Window { start, end, ino });
            Some(start)
        } else {
            None
        };

        inner.by_ino.insert(
            ino,
            InodeRsv {
                window_start,
                goal_size,
                hits,
                last_logical: logical + u64::from(alloc_len) - 1,
                last_physical: alloc_end - 1,
            },
        );

        tracing::trace!(
            target: "jext::alloc",
            ino = ino.0,
            start = alloc_start,
            len = alloc_len,
            hit,
            goal_size,
            "reservation_updated"
        );
    }

    /// Drop the window and pattern state for `ino`. Called on truncate,
    /// final close, and transaction abort.
    pub fn discard(&self, ino: InodeNumber) {
        let mut inner = self.inner.lock();
        if let Some(rsv) = inner.by_ino.remove(&ino) {
            if let Some(key) = rsv.window_start {
                inner.windows.remove(&key);
            }
        }
    }

    /// Shrink or remove windows overlapping a freed block range so no
    /// window keeps steering its owner into blocks fenced until commit.
    /// A window straddling the freed run keeps only its part before it.
    pub fn trim_freed(&self, freed_start: u64, count: u64) {
        if count == 0 {
            return;
        }
        let freed_end = freed_start.saturating_add(count);
        let mut inner = self.inner.lock();
        for key in inner.overlapping(freed_start, freed_end) {
            let Some(window) = inner.windows.get(&key).copied() else {
                continue;
            };
            if window.start >= freed_start && window.end <= freed_end {
                inner.windows.remove(&key);
                if let Some(rsv) = inner.by_ino.get_mut(&window.ino) {
                    rsv.window_start = None;
                }
            } else if window.start < freed_start {
                // Tail or middle overlap: keep the part before the run.
                if let Some(w) = inner.windows.get_mut(&key) {
                    w.end = freed_start;
                }
            } else {
                // The run covers the head: slide the window past it.
                inner.windows.remove(&key);
                inner.windows.insert(
                    freed_end,
                    Window {
                        start: freed_end,
                        ..window
                    },
                );
                if let Some(rsv) = inner.by_ino.get_mut(&window.ino) {
                    rsv.window_start = Some(freed_end);
                }
            }
        }
    }

    /// Foreign windows intersecting `[lo, hi)`, clipped to those bounds.
    /// The allocator masks these ranges out of its free-bit search so one
    /// inode never allocates inside another's window.
    #[must_use]
    pub fn masked_ranges(
        &self,
        lo: u64,
        hi: u64,
        except: Option<InodeNumber>,
    ) -> Vec<(u64, u64)> {
        let inner = self.inner.lock();
        inner
            .overlapping(lo, hi)
            .into_iter()
            .filter_map(|key| {
                let window = inner.windows.get(&key)?;
                if except == Some(window.ino) {
                    return None;
                }
                Some((window.start.max(lo), window.end.min(hi)))
            })
            .collect()
    }

    fn displace(inner: &mut TreeInner, ino: InodeNumber, lo: u64, hi: u64) {
        for key in inner.overlapping(lo, hi) {
            let Some(window) = inner.windows.get(&key).copied() else {
                continue;
            };
            if window.ino == ino {
                inner.windows.remove(&key);
            } else if window.start >= lo && window.end <= hi {
                inner.windows.remove(&key);
                if let Some(rsv) = inner.by_ino.get_mut(&window.ino) {
                    rsv.window_start = None;
                }
                tracing::trace!(
                    target: "jext::alloc",
                    ino = window.ino.0,
                    "window_evicted"
                );
            } else if window.start < lo {
                // Keep the incumbent's head; also covers a full straddle.
                if let Some(w) = inner.windows.get_mut(&key) {
                    w.end = lo;
                }
            } else {
                inner.windows.remove(&key);
                inner.windows.insert(
                    hi,
                    Window {
                        start: hi,
                        ..window
                    },
                );
                if let Some(rsv) = inner.by_ino.get_mut(&window.ino) {
                    rsv.window_start = Some(hi);
                }
            }
        }
    }
}
