//! Append-only log adapters.
//!
//! The broker only talks to a log through the [`LogStore`] trait: append,
//! blocking tail-follow, and bounded historical reads, all keyed by
//! monotonically increasing [`EntryId`]s.

mod file;
mod memory;

pub use file::{FileLog, FileLogConfig};
pub use memory::MemoryLog;

use crate::error::{BrokerError, Result};
use crate::types::{now_millis, EntryId, Fields, Record};
use parking_lot::{Condvar, MutexGuard};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// How long a tail read may wait for new records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Block {
    /// Return immediately, possibly with an empty batch.
    No,
    /// Wait at most this long.
    Timeout(Duration),
    /// Wait until a record arrives or the store is interrupted.
    Forever,
}

/// How a log assigns ids to appended records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// `1-0`, `2-0`, `3-0`, ...
    #[default]
    Sequential,
    /// Milliseconds since the epoch; appends within the same millisecond (or
    /// after a clock regression) bump the sequence part.
    Timestamp,
}

impl IdStrategy {
    /// The id to assign after `last`. Fails with `InvalidId` once the id
    /// space above `last` is used up.
    pub fn next_id(self, last: Option<EntryId>) -> Result<EntryId> {
        let exhausted = |last: EntryId| BrokerError::InvalidId(format!("no id after {}", last));
        match self {
            IdStrategy::Sequential => match last {
                Some(last) => last
                    .ms
                    .checked_add(1)
                    .map(|ms| EntryId::new(ms, 0))
                    .ok_or_else(|| exhausted(last)),
                None => Ok(EntryId::new(1, 0)),
            },
            IdStrategy::Timestamp => {
                let now = now_millis();
                match last {
                    Some(last) if now <= last.ms => last.successor().ok_or_else(|| exhausted(last)),
                    _ => Ok(EntryId::new(now, 0)),
                }
            }
        }
    }
}

/// An ordered, append-only record log.
///
/// Implementations provide their own locking; every method may be called
/// concurrently from any thread.
pub trait LogStore: Send + Sync {
    /// Append a record under a freshly assigned id.
    fn append(&self, fields: Fields) -> Result<EntryId>;

    /// Append a record under an explicit id, which must be greater than the
    /// current tail.
    fn append_with_id(&self, id: EntryId, fields: Fields) -> Result<EntryId>;

    /// Up to `count` records with ids strictly greater than `after`
    /// (`None` reads from the start), waiting per `block` when none exist.
    ///
    /// Returns an empty batch on timeout or after [`LogStore::interrupt`].
    fn read_after(&self, after: Option<EntryId>, count: usize, block: Block) -> Result<Vec<Record>>;

    /// Records with ids at or after `from` in ascending order, bounded by
    /// `count` and by the tail at call time. Never blocks.
    fn read_range(&self, from: Option<EntryId>, count: Option<usize>) -> Result<Vec<Record>>;

    /// Id of the newest record, if any.
    fn last_id(&self) -> Result<Option<EntryId>>;

    /// Number of records in the log.
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Wake every thread blocked in [`LogStore::read_after`].
    fn interrupt(&self);
}

/// Reject explicit ids that would break ordering.
pub(crate) fn check_explicit_id(id: EntryId, last: Option<EntryId>) -> Result<()> {
    if id == EntryId::MIN {
        return Err(BrokerError::InvalidId(
            "0-0 is reserved and cannot be assigned".into(),
        ));
    }
    match last {
        Some(last) if id <= last => Err(BrokerError::IdNotIncreasing { id, last }),
        _ => Ok(()),
    }
}

/// Index of the first element whose id is strictly greater than `after`.
pub(crate) fn first_after<T>(items: &[T], after: Option<EntryId>, id_of: impl Fn(&T) -> EntryId) -> usize {
    match after {
        Some(after) => items.partition_point(|item| id_of(item) <= after),
        None => 0,
    }
}

/// Index of the first element whose id is at or after `from`.
pub(crate) fn first_at<T>(items: &[T], from: Option<EntryId>, id_of: impl Fn(&T) -> EntryId) -> usize {
    match from {
        Some(from) => items.partition_point(|item| id_of(item) < from),
        None => 0,
    }
}

/// State every waiting reader needs to see: how many records exist and how
/// many interrupts have been issued.
pub(crate) trait TailState {
    fn has_after(&self, after: Option<EntryId>) -> bool;
    fn interrupts(&self) -> u64;
}

/// Park on `cond` until a record after `after` exists, the store is
/// interrupted, or `block` expires.
pub(crate) fn wait_for_tail<T: TailState>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    after: Option<EntryId>,
    block: Block,
) {
    let epoch = guard.interrupts();
    let deadline = match block {
        Block::No => return,
        Block::Timeout(d) => Some(Instant::now() + d),
        Block::Forever => None,
    };

    while !guard.has_after(after) && guard.interrupts() == epoch {
        match deadline {
            Some(deadline) => {
                if cond.wait_until(guard, deadline).timed_out() {
                    return;
                }
            }
            None => cond.wait(guard),
        }
    }
}
