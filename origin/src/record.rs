//! Tag records and the clock that orders them.

use std::cmp::Ordering;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{digest::Digest, node::NodeId};

/// The stored value of a tag: which manifest it points at, and when and
/// where that was decided.
///
/// Replicas keep whichever record is greatest under `(timestamp, origin,
/// digest)`, so every replica converges on the same winner regardless of
/// the order writes arrive in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    /// The manifest the tag resolves to.
    pub digest: Digest,
    /// When the coordinating origin accepted the write.
    pub timestamp: DateTime<Utc>,
    /// The coordinating origin.
    pub origin: NodeId,
}

impl TagRecord {
    /// Create a record.
    pub fn new(digest: Digest, timestamp: DateTime<Utc>, origin: NodeId) -> Self {
        Self {
            digest,
            timestamp,
            origin,
        }
    }

    fn order(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.origin.cmp(&other.origin))
            .then_with(|| self.digest.cmp(&other.digest))
    }

    /// Whether this record wins over `other` under last-writer-wins.
    pub fn supersedes(&self, other: &TagRecord) -> bool {
        self.order(other) == Ordering::Greater
    }

    /// The newest of a set of records.
    pub fn newest<'r>(records: impl IntoIterator<Item = &'r TagRecord>) -> Option<&'r TagRecord> {
        records.into_iter().max_by(|a, b| a.order(b))
    }
}

/// Wall-clock timestamps which never repeat or go backwards on one node.
#[derive(Debug, Default)]
pub struct Clock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl Clock {
    /// Create a clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current time, or one microsecond past the last reading if the
    /// wall clock has not advanced.
    pub fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock();
        let mut now = Utc::now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + TimeDelta::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(digest: &[u8], micros: i64, origin: &str) -> TagRecord {
        TagRecord::new(
            Digest::sha256(digest),
            DateTime::from_timestamp_micros(micros).unwrap(),
            origin.into(),
        )
    }

    #[test]
    fn later_timestamp_wins() {
        let old = record(b"a", 10, "z");
        let new = record(b"b", 11, "a");
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
        assert!(!new.supersedes(&new));
    }

    #[test]
    fn ties_break_on_origin_then_digest() {
        let a = record(b"x", 10, "origin-a");
        let b = record(b"x", 10, "origin-b");
        assert!(b.supersedes(&a));

        let records = [a.clone(), b.clone()];
        assert_eq!(TagRecord::newest(&records), Some(&b));
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = Clock::new();
        let mut previous = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > previous);
            previous = next;
        }
    }
}
