//! Subscription types for live delivery.

use crate::types::Entry;
use crossbeam_channel::{bounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::registry::SubscriberRegistry;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a subscription stopped receiving entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Cancelled by its owner.
    Unsubscribed,
    /// Buffer overflowed or a send timed out (slow consumer).
    Lagged,
    /// The broker shut down.
    Shutdown,
    /// The log became unreadable; the broker stopped.
    LogUnavailable(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Unsubscribed => write!(f, "unsubscribed"),
            CloseReason::Lagged => write!(f, "lagged"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::LogUnavailable(reason) => write!(f, "log unavailable: {}", reason),
        }
    }
}

/// Close status shared between a subscription handle and its registry slot.
///
/// The reason is written before the sending half is dropped, so a receiver
/// that observes disconnection always finds it set. Sends happen while the
/// reason lock is held, so nothing is sent once [`CloseState::mark`] returns.
pub(crate) struct CloseState {
    reason: Mutex<Option<CloseReason>>,
    /// Dropped on close, which disconnects `closed`.
    signal: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
}

impl CloseState {
    pub(crate) fn new() -> Self {
        let (signal, closed) = bounded(0);
        Self {
            reason: Mutex::new(None),
            signal: Mutex::new(Some(signal)),
            closed,
        }
    }

    pub(crate) fn reason(&self) -> Option<CloseReason> {
        self.reason.lock().clone()
    }

    /// Run `f` only while still open, holding the reason lock throughout.
    /// `f` must not block.
    pub(crate) fn while_open<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let reason = self.reason.lock();
        if reason.is_some() {
            return None;
        }
        Some(f())
    }

    /// Record why the subscription closed; the first reason wins.
    pub(crate) fn mark(&self, reason: CloseReason) {
        let mut current = self.reason.lock();
        if current.is_none() {
            *current = Some(reason);
            self.signal.lock().take();
        }
    }

    /// Becomes ready (disconnected) once closed.
    pub(crate) fn closed(&self) -> &Receiver<()> {
        &self.closed
    }
}

pub(crate) type CloseSlot = Arc<CloseState>;

/// Handle to a live subscription.
///
/// Entries arrive in log order. When the subscription ends the channel
/// disconnects and [`Subscription::close_reason`] says why. Dropping the
/// handle unregisters it.
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) receiver: Receiver<Entry>,
    pub(crate) status: CloseSlot,
    pub(crate) registry: Arc<SubscriberRegistry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receive the next entry (blocking).
    ///
    /// Buffered entries are still returned after the subscription closes;
    /// `Err` means the channel is both closed and drained.
    pub fn recv(&self) -> Result<Entry, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an entry (non-blocking).
    pub fn try_recv(&self) -> Result<Entry, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Entry, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Blocking iterator that ends when the subscription closes.
    pub fn iter(&self) -> crossbeam_channel::Iter<'_, Entry> {
        self.receiver.iter()
    }

    /// The raw receiver, for use with `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<Entry> {
        &self.receiver
    }

    /// Why the subscription closed, or `None` while it is live.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.status.reason()
    }

    pub fn is_closed(&self) -> bool {
        self.status.reason().is_some()
    }

    /// Unregister now instead of on drop.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("buffered", &self.receiver.len())
            .field("close_reason", &self.close_reason())
            .finish()
    }
}
