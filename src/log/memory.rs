//! In-process log.

use super::{check_explicit_id, first_after, first_at, wait_for_tail, Block, IdStrategy, LogStore, TailState};
use crate::error::Result;
use crate::types::{EntryId, Fields, Record};
use parking_lot::{Condvar, Mutex};

struct Inner {
    records: Vec<Record>,
    interrupts: u64,
}

impl TailState for Inner {
    fn has_after(&self, after: Option<EntryId>) -> bool {
        match (self.records.last(), after) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(last), Some(after)) => last.id > after,
        }
    }

    fn interrupts(&self) -> u64 {
        self.interrupts
    }
}

/// Append-only log held in memory.
pub struct MemoryLog {
    inner: Mutex<Inner>,
    appended: Condvar,
    strategy: IdStrategy,
}

impl MemoryLog {
    /// Create an empty log with sequential ids.
    pub fn new() -> Self {
        Self::with_strategy(IdStrategy::Sequential)
    }

    /// Create an empty log with the given id strategy.
    pub fn with_strategy(strategy: IdStrategy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: Vec::new(),
                interrupts: 0,
            }),
            appended: Condvar::new(),
            strategy,
        }
    }

    fn push(&self, inner: &mut Inner, record: Record) -> EntryId {
        let id = record.id;
        inner.records.push(record);
        self.appended.notify_all();
        id
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryLog {
    fn append(&self, fields: Fields) -> Result<EntryId> {
        let mut inner = self.inner.lock();
        let id = self.strategy.next_id(inner.records.last().map(|r| r.id))?;
        Ok(self.push(&mut inner, Record::new(id, fields)))
    }

    fn append_with_id(&self, id: EntryId, fields: Fields) -> Result<EntryId> {
        let mut inner = self.inner.lock();
        check_explicit_id(id, inner.records.last().map(|r| r.id))?;
        Ok(self.push(&mut inner, Record::new(id, fields)))
    }

    fn read_after(&self, after: Option<EntryId>, count: usize, block: Block) -> Result<Vec<Record>> {
        let mut inner = self.inner.lock();
        wait_for_tail(&self.appended, &mut inner, after, block);

        let start = first_after(&inner.records, after, |r| r.id);
        Ok(inner.records[start..].iter().take(count).cloned().collect())
    }

    fn read_range(&self, from: Option<EntryId>, count: Option<usize>) -> Result<Vec<Record>> {
        let inner = self.inner.lock();
        let start = first_at(&inner.records, from, |r| r.id);
        let tail = &inner.records[start..];
        let limit = count.unwrap_or(tail.len());
        Ok(tail.iter().take(limit).cloned().collect())
    }

    fn last_id(&self) -> Result<Option<EntryId>> {
        Ok(self.inner.lock().records.last().map(|r| r.id))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.inner.lock().records.len())
    }

    fn interrupt(&self) {
        let mut inner = self.inner.lock();
        inner.interrupts += 1;
        self.appended.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message_fields;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_append_assigns_sequential_ids() {
        let log = MemoryLog::new();
        assert_eq!(log.append(message_fields("a")).unwrap(), EntryId::new(1, 0));
        assert_eq!(log.append(message_fields("b")).unwrap(), EntryId::new(2, 0));
        assert_eq!(log.len().unwrap(), 2);
        assert_eq!(log.last_id().unwrap(), Some(EntryId::new(2, 0)));
    }

    #[test]
    fn test_read_range_bounds() {
        let log = MemoryLog::new();
        for p in ["a", "b", "c", "d"] {
            log.append(message_fields(p)).unwrap();
        }

        let all = log.read_range(None, None).unwrap();
        assert_eq!(all.len(), 4);

        let page = log.read_range(Some(EntryId::new(2, 0)), Some(2)).unwrap();
        let ids: Vec<_> = page.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![EntryId::new(2, 0), EntryId::new(3, 0)]);
    }

    #[test]
    fn test_read_after_non_blocking() {
        let log = MemoryLog::new();
        assert!(log.read_after(None, 10, Block::No).unwrap().is_empty());

        log.append(message_fields("a")).unwrap();
        log.append(message_fields("b")).unwrap();
        let batch = log.read_after(Some(EntryId::new(1, 0)), 10, Block::No).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, EntryId::new(2, 0));
    }

    #[test]
    fn test_read_after_times_out() {
        let log = MemoryLog::new();
        let start = Instant::now();
        let batch = log
            .read_after(None, 1, Block::Timeout(Duration::from_millis(30)))
            .unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_read_after_wakes_on_append() {
        let log = Arc::new(MemoryLog::new());
        let reader = {
            let log = Arc::clone(&log);
            thread::spawn(move || log.read_after(None, 10, Block::Forever).unwrap())
        };

        thread::sleep(Duration::from_millis(20));
        log.append(message_fields("late")).unwrap();

        let batch = reader.join().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, EntryId::new(1, 0));
    }

    #[test]
    fn test_interrupt_releases_blocked_reader() {
        let log = Arc::new(MemoryLog::new());
        let reader = {
            let log = Arc::clone(&log);
            thread::spawn(move || log.read_after(None, 10, Block::Forever).unwrap())
        };

        thread::sleep(Duration::from_millis(20));
        log.interrupt();

        assert!(reader.join().unwrap().is_empty());
    }

    #[test]
    fn test_explicit_ids_must_increase() {
        let log = MemoryLog::new();
        log.append_with_id(EntryId::new(5, 0), message_fields("a")).unwrap();
        assert!(log.append_with_id(EntryId::new(5, 0), message_fields("b")).is_err());
        assert!(log.append_with_id(EntryId::new(4, 9), message_fields("b")).is_err());

        // Auto ids continue after the explicit tail.
        assert_eq!(log.append(message_fields("c")).unwrap(), EntryId::new(6, 0));
    }

    #[test]
    fn test_append_after_top_id_fails() {
        let log = MemoryLog::new();
        log.append_with_id(EntryId::new(u64::MAX, 0), message_fields("top"))
            .unwrap();

        assert!(matches!(
            log.append(message_fields("next")),
            Err(crate::error::BrokerError::InvalidId(_))
        ));
        assert_eq!(log.len().unwrap(), 1);
    }
}
