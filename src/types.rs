//! Core types shared by the log adapters and the broker.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Field carrying the payload of a published message.
pub const MESSAGE_FIELD: &str = "message";

/// Stream-style entry identifier, displayed as `<ms>-<seq>`.
///
/// Ordered by `ms` first, then `seq`. `0-0` is the minimum and is never
/// assigned to an entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than this one, or `None` at the top of
    /// the id space.
    pub fn successor(self) -> Option<Self> {
        match self.seq.checked_add(1) {
            Some(seq) => Some(EntryId::new(self.ms, seq)),
            None => Some(EntryId::new(self.ms.checked_add(1)?, 0)),
        }
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({}-{})", self.ms, self.seq)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = BrokerError;

    /// Parses `"<ms>-<seq>"`; a bare `"<ms>"` means `<ms>-0`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BrokerError::InvalidId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        let ms = ms.parse::<u64>().map_err(|_| invalid())?;
        let seq = seq.parse::<u64>().map_err(|_| invalid())?;
        Ok(EntryId::new(ms, seq))
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for EntryId {
    type Error = BrokerError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Field-value map of a log record.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// A raw record as stored in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: EntryId,
    pub fields: Fields,
}

impl Record {
    pub fn new(id: EntryId, fields: Fields) -> Self {
        Self { id, fields }
    }
}

/// Build the field map for a published message.
pub fn message_fields(payload: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(
        MESSAGE_FIELD.to_string(),
        serde_json::Value::String(payload.to_string()),
    );
    fields
}

/// A decoded log entry: id plus message payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub payload: String,
}

impl Entry {
    pub fn new(id: EntryId, payload: impl Into<String>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

impl TryFrom<&Record> for Entry {
    type Error = BrokerError;

    fn try_from(record: &Record) -> Result<Self> {
        match record.fields.get(MESSAGE_FIELD) {
            Some(serde_json::Value::String(payload)) => Ok(Entry::new(record.id, payload.clone())),
            Some(other) => Err(BrokerError::MalformedEntry {
                id: record.id,
                reason: format!("field `{}` is not a string: {}", MESSAGE_FIELD, other),
            }),
            None => Err(BrokerError::MalformedEntry {
                id: record.id,
                reason: format!("missing field `{}`", MESSAGE_FIELD),
            }),
        }
    }
}

impl TryFrom<Record> for Entry {
    type Error = BrokerError;

    fn try_from(record: Record) -> Result<Self> {
        Entry::try_from(&record)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
