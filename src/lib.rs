//! # tailcast
//!
//! Live fan-out of an append-only log to any number of subscribers, with
//! point-in-time replay of history.
//!
//! ## Core Concepts
//!
//! - **Log**: ordered, append-only records keyed by `<ms>-<seq>` ids
//!   ([`MemoryLog`], [`FileLog`], or any [`LogStore`])
//! - **Broker**: publishes to the log and runs one broadcast thread that
//!   follows the tail and fans entries out
//! - **Subscriptions**: per-subscriber bounded channels; slow readers are
//!   closed instead of stalling the rest
//! - **Replay**: finite, ordered snapshot of past entries
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tailcast::{Broker, BrokerConfig, MemoryLog};
//!
//! let broker = Broker::start(Arc::new(MemoryLog::new()), BrokerConfig::default())?;
//!
//! let sub = broker.subscribe()?;
//! broker.publish("hello")?;
//!
//! let entry = sub.recv().expect("broker running");
//! assert_eq!(entry.payload, "hello");
//!
//! let history = broker.list_messages()?;
//! assert_eq!(history.len(), 1);
//!
//! broker.shutdown()?;
//! # Ok::<(), tailcast::BrokerError>(())
//! ```

pub mod broker;
pub mod error;
pub mod log;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use broker::{Broker, BrokerConfig};
pub use error::{BrokerError, Result};
pub use log::{Block, FileLog, FileLogConfig, IdStrategy, LogStore, MemoryLog};
pub use subscriptions::{CloseReason, SubscriberRegistry, Subscription, SubscriptionId};
pub use types::{message_fields, Entry, EntryId, Fields, Record, MESSAGE_FIELD};
