//! Records pulled from a message source
//!
//! A [`Record`] carries its log coordinate (topic, partition, offset) next to the
//! payload. The coordinate alone is what gets committed once processing is done.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::fmt;

/// Position of a record in the log, used to request an offset commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitCoordinate {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl CommitCoordinate {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for CommitCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// A single message consumed from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Topic the record was read from
    pub topic: String,

    /// Partition within the topic
    pub partition: i32,

    /// Offset within the partition (monotonic per partition)
    pub offset: i64,

    /// Optional message key
    pub key: Option<Vec<u8>>,

    /// Message payload
    pub payload: Vec<u8>,

    /// Message headers, in the order the broker delivered them
    pub headers: Vec<(String, Vec<u8>)>,

    /// Broker timestamp (or fetch time when the broker provides none)
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Create a record with no key or headers, stamped with the current time.
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: payload.into(),
            headers: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Append a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the broker timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The coordinate to commit once this record has been processed.
    pub fn coordinate(&self) -> CommitCoordinate {
        CommitCoordinate::new(self.topic.clone(), self.partition, self.offset)
    }

    /// First header with the given name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// How long ago the broker stamped the record
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }
}
