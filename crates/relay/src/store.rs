//! Latest-value cache: one [`StoredEntry`] per zone key.
//!
//! Entries are created on the first accepted reading for a key, overwritten
//! by every later one, and never evicted. Staleness is judged against the
//! server clock captured at ingestion, never the device timestamp.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::reading::{Reading, ZoneKey};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub key: ZoneKey,
    pub reading: Reading,
    pub received_at: OffsetDateTime,
}

impl StoredEntry {
    pub fn is_stale(&self, now: OffsetDateTime, threshold: Duration) -> bool {
        is_stale(self, now, threshold)
    }
}

/// `true` once strictly more than `threshold` has passed since the entry
/// was received. An entry exactly `threshold` old is still fresh.
pub fn is_stale(entry: &StoredEntry, now: OffsetDateTime, threshold: Duration) -> bool {
    now - entry.received_at > threshold
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle; all clones share one map.
#[derive(Clone, Default)]
pub struct ReadingStore {
    entries: Arc<RwLock<HashMap<ZoneKey, StoredEntry>>>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `key`. Never merges with the
    /// previous reading.
    pub async fn upsert(&self, key: ZoneKey, reading: Reading, now: OffsetDateTime) {
        let entry = StoredEntry {
            key: key.clone(),
            reading,
            received_at: now,
        };
        self.entries.write().await.insert(key, entry);
    }

    /// `None` only when `key` has never been ingested.
    pub async fn get(&self, key: &ZoneKey) -> Option<StoredEntry> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn all_keys(&self) -> BTreeSet<ZoneKey> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Snapshot of every entry, sorted by key.
    pub async fn entries(&self) -> Vec<StoredEntry> {
        let mut entries: Vec<StoredEntry> = self.entries.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::DeviceTimestamp;
    use time::macros::datetime;

    const THRESHOLD: Duration = Duration::from_secs(15);

    fn reading(node: &str, zone: &str, current_ma: f64) -> Reading {
        Reading {
            node_id: node.into(),
            zone_id: zone.into(),
            device_timestamp: DeviceTimestamp::Number(1u64.into()),
            current_ma,
            voltage_v: 3.3,
            power_mw: current_ma * 3.3,
        }
    }

    fn key(node: &str, zone: &str) -> ZoneKey {
        ZoneKey::new(node, zone)
    }

    // -- get / upsert -------------------------------------------------------

    #[tokio::test]
    async fn get_unknown_key_is_none() {
        let store = ReadingStore::new();
        assert!(store.get(&key("node1", "zone9")).await.is_none());
        assert_eq!(store.all_keys().await.len(), 0);
    }

    #[tokio::test]
    async fn upsert_then_get_returns_entry() {
        let store = ReadingStore::new();
        let t = datetime!(2025-06-01 12:00:00 UTC);
        store.upsert(key("node1", "zone1"), reading("node1", "zone1", 6.3), t).await;

        let entry = store.get(&key("node1", "zone1")).await.unwrap();
        assert_eq!(entry.key, key("node1", "zone1"));
        assert_eq!(entry.reading.current_ma, 6.3);
        assert_eq!(entry.received_at, t);
    }

    #[tokio::test]
    async fn later_upsert_wins_without_merging() {
        let store = ReadingStore::new();
        let k = key("node1", "zone1");
        let t1 = datetime!(2025-06-01 12:00:00 UTC);
        let t2 = datetime!(2025-06-01 12:00:05 UTC);

        store.upsert(k.clone(), reading("node1", "zone1", 6.3), t1).await;
        let second = Reading {
            device_timestamp: DeviceTimestamp::Text("boot".into()),
            ..reading("node1", "zone1", 9.9)
        };
        store.upsert(k.clone(), second.clone(), t2).await;

        let entry = store.get(&k).await.unwrap();
        assert_eq!(entry.reading, second);
        assert_eq!(entry.received_at, t2);
        assert_eq!(store.all_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn all_keys_and_entries_are_sorted() {
        let store = ReadingStore::new();
        let t = datetime!(2025-06-01 12:00:00 UTC);
        store.upsert(key("node1", "zone3"), reading("node1", "zone3", 1.0), t).await;
        store.upsert(key("node1", "zone1"), reading("node1", "zone1", 2.0), t).await;

        let keys: Vec<ZoneKey> = store.all_keys().await.into_iter().collect();
        assert_eq!(keys, [key("node1", "zone1"), key("node1", "zone3")]);

        let entries = store.entries().await;
        assert_eq!(entries[0].key, key("node1", "zone1"));
        assert_eq!(entries[1].key, key("node1", "zone3"));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = ReadingStore::new();
        let handle = store.clone();
        let t = datetime!(2025-06-01 12:00:00 UTC);
        handle.upsert(key("n", "z"), reading("n", "z", 1.0), t).await;
        assert!(store.get(&key("n", "z")).await.is_some());
    }

    // -- staleness ----------------------------------------------------------

    fn entry_at(received_at: OffsetDateTime) -> StoredEntry {
        StoredEntry {
            key: key("node1", "zone1"),
            reading: reading("node1", "zone1", 1.0),
            received_at,
        }
    }

    #[test]
    fn fresh_within_threshold() {
        let t = datetime!(2025-06-01 12:00:00 UTC);
        let e = entry_at(t);
        assert!(!is_stale(&e, t, THRESHOLD));
        assert!(!is_stale(&e, datetime!(2025-06-01 12:00:14.999 UTC), THRESHOLD));
    }

    #[test]
    fn exactly_threshold_is_not_stale() {
        let e = entry_at(datetime!(2025-06-01 12:00:00 UTC));
        assert!(!e.is_stale(datetime!(2025-06-01 12:00:15 UTC), THRESHOLD));
    }

    #[test]
    fn just_past_threshold_is_stale() {
        let e = entry_at(datetime!(2025-06-01 12:00:00 UTC));
        assert!(e.is_stale(datetime!(2025-06-01 12:00:15.000001 UTC), THRESHOLD));
    }

    #[test]
    fn clock_behind_entry_is_not_stale() {
        let e = entry_at(datetime!(2025-06-01 12:00:10 UTC));
        assert!(!e.is_stale(datetime!(2025-06-01 12:00:00 UTC), THRESHOLD));
    }

    #[tokio::test]
    async fn unknown_and_stale_are_distinct() {
        let store = ReadingStore::new();
        let t = datetime!(2025-06-01 12:00:00 UTC);
        store.upsert(key("node1", "zone1"), reading("node1", "zone1", 1.0), t).await;

        let later = datetime!(2025-06-01 12:05:00 UTC);
        let known = store.get(&key("node1", "zone1")).await.unwrap();
        assert!(known.is_stale(later, THRESHOLD));
        assert!(store.get(&key("node1", "zone2")).await.is_none());
    }

    // -- concurrency --------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_to_distinct_keys() {
        const N: usize = 64;
        let store = ReadingStore::new();
        let t = datetime!(2025-06-01 12:00:00 UTC);

        let mut tasks = Vec::with_capacity(N);
        for i in 0..N {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let zone = format!("zone{i}");
                store
                    .upsert(key("node1", &zone), reading("node1", &zone, i as f64), t)
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.all_keys().await.len(), N);
        for i in 0..N {
            let zone = format!("zone{i}");
            let entry = store.get(&key("node1", &zone)).await.unwrap();
            assert_eq!(entry.reading.zone_id, zone);
            assert_eq!(entry.reading.current_ma, i as f64);
        }
    }
}
