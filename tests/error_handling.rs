//! Error handling and edge case tests.

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tailcast::{
    message_fields, Block, Broker, BrokerConfig, BrokerError, CloseReason, EntryId, Fields,
    FileLog, LogStore, MemoryLog, Record,
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(2);

/// A memory log whose reads and writes can be made to fail.
#[derive(Default)]
struct FlakyLog {
    inner: MemoryLog,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyLog {
    fn break_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
        self.inner.interrupt();
    }
}

impl LogStore for FlakyLog {
    fn append(&self, fields: Fields) -> tailcast::Result<EntryId> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BrokerError::LogUnavailable("connection refused".into()));
        }
        self.inner.append(fields)
    }

    fn append_with_id(&self, id: EntryId, fields: Fields) -> tailcast::Result<EntryId> {
        self.inner.append_with_id(id, fields)
    }

    fn read_after(
        &self,
        after: Option<EntryId>,
        count: usize,
        block: Block,
    ) -> tailcast::Result<Vec<Record>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BrokerError::LogUnavailable("connection reset".into()));
        }
        // Wake up regularly so a failure injected mid-wait is noticed.
        let block = match block {
            Block::Forever => Block::Timeout(Duration::from_millis(10)),
            other => other,
        };
        let batch = self.inner.read_after(after, count, block)?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BrokerError::LogUnavailable("connection reset".into()));
        }
        Ok(batch)
    }

    fn read_range(&self, from: Option<EntryId>, count: Option<usize>) -> tailcast::Result<Vec<Record>> {
        self.inner.read_range(from, count)
    }

    fn last_id(&self) -> tailcast::Result<Option<EntryId>> {
        self.inner.last_id()
    }

    fn len(&self) -> tailcast::Result<usize> {
        self.inner.len()
    }

    fn interrupt(&self) {
        self.inner.interrupt()
    }
}

// --- Log failures ---

#[test]
fn test_log_failure_stops_loop_and_closes_subscribers() {
    let log = Arc::new(FlakyLog::default());
    let broker = Broker::start(log.clone(), BrokerConfig::default()).unwrap();
    let sub = broker.subscribe().unwrap();

    log.break_reads();

    let result = broker.join();
    assert!(matches!(result, Err(BrokerError::LogUnavailable(_))));
    assert!(!broker.is_running());

    assert!(sub.recv_timeout(WAIT).is_err());
    match sub.close_reason() {
        Some(CloseReason::LogUnavailable(reason)) => assert!(reason.contains("connection reset")),
        other => panic!("unexpected close reason: {other:?}"),
    }

    assert!(matches!(broker.subscribe(), Err(BrokerError::AlreadyStopped)));
}

#[test]
fn test_publish_failure_is_returned() {
    let log = Arc::new(FlakyLog::default());
    let broker = Broker::start(log.clone(), BrokerConfig::default()).unwrap();

    log.fail_writes.store(true, Ordering::SeqCst);
    let result = broker.publish("lost");
    match result {
        Err(BrokerError::PublishFailed(msg)) => assert!(msg.contains("connection refused")),
        other => panic!("expected publish failure, got {other:?}"),
    }
    assert!(broker.is_running());

    log.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(broker.publish("kept").unwrap(), EntryId::new(1, 0));
}

// --- Malformed entries ---

#[test]
fn test_malformed_entries_skipped_live_and_in_replay() {
    let log = Arc::new(MemoryLog::new());
    let broker = Broker::start(log.clone(), BrokerConfig::default()).unwrap();
    let sub = broker.subscribe().unwrap();

    let mut numeric = Fields::new();
    numeric.insert("message".into(), json!(7));
    let mut missing = Fields::new();
    missing.insert("text".into(), json!("wrong field"));

    broker.publish("first").unwrap();
    log.append(numeric).unwrap();
    log.append(missing).unwrap();
    broker.publish("last").unwrap();

    assert_eq!(sub.recv_timeout(WAIT).unwrap().payload, "first");
    let last = sub.recv_timeout(WAIT).unwrap();
    assert_eq!(last.payload, "last");
    assert_eq!(last.id, EntryId::new(4, 0));

    let replayed: Vec<_> = broker.list_messages().unwrap().into_iter().map(|e| e.payload).collect();
    assert_eq!(replayed, vec!["first", "last"]);
}

// --- Ids ---

#[test]
fn test_explicit_id_must_increase() {
    let log = MemoryLog::new();
    log.append_with_id(EntryId::new(10, 0), message_fields("a")).unwrap();

    let result = log.append_with_id(EntryId::new(9, 0), message_fields("b"));
    match result {
        Err(BrokerError::IdNotIncreasing { id, last }) => {
            assert_eq!(id, EntryId::new(9, 0));
            assert_eq!(last, EntryId::new(10, 0));
        }
        other => panic!("unexpected: {other:?}"),
    }

    assert!(matches!(
        log.append_with_id(EntryId::MIN, message_fields("c")),
        Err(BrokerError::InvalidId(_))
    ));
}

#[test]
fn test_invalid_id_strings() {
    for bad in ["", "-", "a-b", "1-2-3", "18446744073709551616-0"] {
        assert!(bad.parse::<EntryId>().is_err(), "{bad:?} should not parse");
    }
}

// --- Lifecycle ---

#[test]
fn test_shutdown_while_idle_returns_promptly() {
    let log = Arc::new(MemoryLog::new());
    let broker = Broker::start(log.clone(), BrokerConfig::default()).unwrap();
    let sub = broker.subscribe().unwrap();

    std::thread::sleep(Duration::from_millis(20));
    broker.shutdown().unwrap();

    assert_eq!(sub.close_reason(), Some(CloseReason::Shutdown));
    assert_eq!(broker.subscriber_count(), 0);

    // Publishing and replay still work against the log.
    broker.publish("after stop").unwrap();
    assert_eq!(broker.list_messages().unwrap().len(), 1);
}

#[test]
fn test_drop_without_shutdown() {
    let log = Arc::new(MemoryLog::new());
    let sub = {
        let broker = Broker::start(log.clone(), BrokerConfig::default()).unwrap();
        broker.subscribe().unwrap()
    };
    assert_eq!(sub.close_reason(), Some(CloseReason::Shutdown));
}

#[test]
fn test_file_log_locked() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    let _first = FileLog::open(&path).unwrap();

    assert!(matches!(FileLog::open(&path), Err(BrokerError::Locked)));
}
