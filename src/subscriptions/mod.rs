//! Subscriptions for live log entries.
//!
//! A [`SubscriberRegistry`] hands out [`Subscription`] handles, each backed by
//! its own bounded channel. Subscribers that can't keep up are closed with
//! [`CloseReason::Lagged`] instead of stalling everyone else.
//!
//! # Example
//!
//! ```ignore
//! let sub = broker.subscribe()?;
//!
//! for entry in sub.iter() {
//!     println!("{} {}", entry.id, entry.payload);
//! }
//! println!("closed: {:?}", sub.close_reason());
//! ```

mod registry;
mod types;

pub(crate) use registry::{Offer, Subscriber};
pub use registry::SubscriberRegistry;
pub use types::{CloseReason, Subscription, SubscriptionId};
