//! Rule groups and per-group storage.

use std::fmt;
use std::ops::{Index, IndexMut};

/// One of the two independent filtering categories.
///
/// Each group has its own sources, compiled index, exception lists and
/// block counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RuleGroup {
    /// Rules that block known trackers
    Tracking = 0,
    /// Rules that block ads
    AdBlocking = 1,
}

impl RuleGroup {
    /// All groups, in index order.
    pub const ALL: [RuleGroup; 2] = [RuleGroup::Tracking, RuleGroup::AdBlocking];

    /// Number of groups.
    pub const COUNT: usize = 2;

    /// Position of this group in a [`PerGroup`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Convert from the persisted integer value.
    ///
    /// Returns `None` for out-of-range values.
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(RuleGroup::Tracking),
            1 => Some(RuleGroup::AdBlocking),
            _ => None,
        }
    }

    /// Convert to the persisted integer value.
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Key of this group's object in the state file.
    pub fn storage_key(self) -> &'static str {
        match self {
            RuleGroup::Tracking => "tracking-rules",
            RuleGroup::AdBlocking => "ad-blocking-rules",
        }
    }

    /// Directory name for this group's on-disk artifacts.
    pub fn dir_name(self) -> &'static str {
        match self {
            RuleGroup::Tracking => "tracking",
            RuleGroup::AdBlocking => "ad-blocking",
        }
    }

    /// Parse a group from a CLI-style name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tracking" | "tracking-rules" | "trackers" => Some(RuleGroup::Tracking),
            "ad-blocking" | "adblocking" | "ad-blocking-rules" | "ads" => {
                Some(RuleGroup::AdBlocking)
            }
            _ => None,
        }
    }
}

impl fmt::Display for RuleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Fixed-size storage with one slot per [`RuleGroup`].
///
/// Indexing takes a `RuleGroup`, so an out-of-range slot cannot be named.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerGroup<T>([T; RuleGroup::COUNT]);

impl<T> PerGroup<T> {
    /// Build each slot from its group.
    pub fn from_fn(mut f: impl FnMut(RuleGroup) -> T) -> Self {
        Self([f(RuleGroup::Tracking), f(RuleGroup::AdBlocking)])
    }

    /// Iterate over `(group, value)` pairs in group order.
    pub fn iter(&self) -> impl Iterator<Item = (RuleGroup, &T)> {
        RuleGroup::ALL.into_iter().zip(self.0.iter())
    }

    /// Mutable iteration over `(group, value)` pairs in group order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RuleGroup, &mut T)> {
        RuleGroup::ALL.into_iter().zip(self.0.iter_mut())
    }

    /// Map each slot to a new value.
    pub fn map<U>(&self, mut f: impl FnMut(RuleGroup, &T) -> U) -> PerGroup<U> {
        PerGroup::from_fn(|group| f(group, &self[group]))
    }
}

impl<T> Index<RuleGroup> for PerGroup<T> {
    type Output = T;

    fn index(&self, group: RuleGroup) -> &T {
        &self.0[group.index()]
    }
}

impl<T> IndexMut<RuleGroup> for PerGroup<T> {
    fn index_mut(&mut self, group: RuleGroup) -> &mut T {
        &mut self.0[group.index()]
    }
}
