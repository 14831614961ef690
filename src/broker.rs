//! Broker tying the log, the subscriber registry and the broadcast loop together.

use crate::error::{BrokerError, Result};
use crate::log::{Block, LogStore};
use crate::subscriptions::{CloseReason, Offer, SubscriberRegistry, Subscription};
use crate::types::{message_fields, Entry, EntryId, Record};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Broker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Entries buffered per subscriber before it is closed as lagging.
    /// Default: 1024
    pub buffer_size: usize,

    /// How long a send may wait on a full subscriber before closing it.
    /// `None` never waits. Default: None
    pub send_timeout: Option<Duration>,

    /// Max records taken from the log tail per cycle.
    /// Default: 256
    pub batch_size: usize,

    /// Name of the broadcast thread.
    pub thread_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            send_timeout: None,
            batch_size: 256,
            thread_name: "tailcast-broadcast".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// State shared with the broadcast thread.
struct Shared {
    store: Arc<dyn LogStore>,
    registry: Arc<SubscriberRegistry>,
    config: BrokerConfig,
    stopping: AtomicBool,
}

/// Fans new log entries out to live subscribers.
///
/// Provides:
/// - Publishing messages to the log
/// - Live subscriptions fed by a background broadcast thread
/// - Point-in-time replay of history
///
/// The broadcast thread follows the tail of the log from the moment the
/// broker starts; earlier entries are only reachable through replay.
pub struct Broker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Broker {
    /// Start a broker over `store` and spawn its broadcast thread.
    pub fn start(store: Arc<dyn LogStore>, config: BrokerConfig) -> Result<Self> {
        let cursor = store
            .last_id()
            .map_err(|e| BrokerError::LogUnavailable(e.to_string()))?;

        let shared = Arc::new(Shared {
            store,
            registry: Arc::new(SubscriberRegistry::new()),
            config,
            stopping: AtomicBool::new(false),
        });

        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(shared.config.thread_name.clone())
                .spawn(move || shared.run(cursor))?
        };

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    // --- Publish / Replay ---

    /// Append a message to the log.
    ///
    /// Returns once the log has accepted it; never waits on subscribers.
    pub fn publish(&self, payload: &str) -> Result<EntryId> {
        let id = self
            .shared
            .store
            .append(message_fields(payload))
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;
        debug!(id = %id, "published");
        Ok(id)
    }

    /// Entries from `from` (inclusive, `None` for the start) up to the
    /// current tail, in id order. Malformed records are skipped.
    pub fn replay(&self, from: Option<EntryId>) -> Result<Vec<Entry>> {
        let records = self.shared.store.read_range(from, None)?;
        Ok(decode_records(records))
    }

    /// Like [`Broker::replay`], reading at most `count` records.
    pub fn replay_page(&self, from: Option<EntryId>, count: usize) -> Result<Vec<Entry>> {
        let records = self.shared.store.read_range(from, Some(count))?;
        Ok(decode_records(records))
    }

    /// Every entry in the log.
    pub fn list_messages(&self) -> Result<Vec<Entry>> {
        self.replay(None)
    }

    // --- Subscriptions ---

    /// Subscribe to entries published from now on.
    pub fn subscribe(&self) -> Result<Subscription> {
        self.subscribe_with(self.shared.config.buffer_size)
    }

    /// Subscribe with a custom buffer size.
    pub fn subscribe_with(&self, buffer_size: usize) -> Result<Subscription> {
        self.shared.registry.register(buffer_size)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.shared.registry
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.shared.store
    }

    /// Whether the broadcast thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    // --- Lifecycle ---

    /// Stop the broadcast thread and close every subscriber.
    ///
    /// Returns the loop's error if it had already failed. Calling this
    /// again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        let handle = match self.handle.lock().take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        info!("broker shutting down");
        self.shared.stopping.store(true, Ordering::SeqCst);

        // The loop may be between its stop check and parking on the log, so
        // keep interrupting until it has actually exited.
        while !handle.is_finished() {
            self.shared.store.interrupt();
            thread::sleep(Duration::from_millis(1));
        }

        handle.join().map_err(|_| BrokerError::LoopPanicked)?
    }

    /// Block until the broadcast thread exits on its own, i.e. the log
    /// failed. Returns that failure.
    pub fn join(&self) -> Result<()> {
        let handle = match self.handle.lock().take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        handle.join().map_err(|_| BrokerError::LoopPanicked)?
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "broadcast loop ended with error");
        }
    }
}

impl Shared {
    /// The broadcast loop: park on the log tail, fan out, repeat.
    fn run(&self, mut cursor: Option<EntryId>) -> Result<()> {
        info!(cursor = ?cursor.map(|c| c.to_string()), "broadcast loop started");

        while !self.stopping.load(Ordering::SeqCst) {
            let batch = match self
                .store
                .read_after(cursor, self.config.batch_size.max(1), Block::Forever)
            {
                Ok(batch) => batch,
                Err(e) => {
                    let reason = e.to_string();
                    error!(error = %reason, label = e.as_label(), "log unavailable; broadcast loop stopping");
                    self.registry
                        .drain(CloseReason::LogUnavailable(reason.clone()));
                    return Err(BrokerError::LogUnavailable(reason));
                }
            };

            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            let Some(last) = batch.last() else {
                continue;
            };
            cursor = Some(last.id);

            let entries = decode_records(batch);
            if !entries.is_empty() {
                self.dispatch(&entries);
            }
        }

        self.registry.drain(CloseReason::Shutdown);
        info!("broadcast loop stopped");
        Ok(())
    }

    /// Deliver `entries` to a snapshot of the registry, outside its lock.
    ///
    /// A subscriber that can't take an entry is closed as lagging and gets
    /// nothing further, so every subscriber sees a gap-free prefix.
    fn dispatch(&self, entries: &[Entry]) {
        let subscribers = self.registry.snapshot();
        let mut lagged = 0usize;

        for subscriber in &subscribers {
            for entry in entries {
                match subscriber.offer(entry, self.config.send_timeout) {
                    Offer::Delivered => {}
                    Offer::Full => {
                        warn!(subscription = %subscriber.id, id = %entry.id, "subscriber lagging; closing");
                        self.registry.close(subscriber.id, CloseReason::Lagged);
                        lagged += 1;
                        break;
                    }
                    Offer::Gone => break,
                }
            }
        }

        debug!(
            entries = entries.len(),
            subscribers = subscribers.len(),
            lagged,
            "dispatched batch"
        );
    }
}

/// Decode records into entries, logging and skipping malformed ones.
fn decode_records(records: Vec<Record>) -> Vec<Entry> {
    records
        .iter()
        .filter_map(|record| match Entry::try_from(record) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping malformed entry");
                None
            }
        })
        .collect()
}
