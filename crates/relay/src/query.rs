//! Read-side view over the store and the session state. Every call answers
//! immediately from current state; nothing here waits for new messages.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;

use crate::reading::ZoneKey;
use crate::session::SessionState;
use crate::store::{ReadingStore, StoredEntry};

#[derive(Debug, Clone, PartialEq)]
pub enum ZoneQuery {
    NotFound,
    Found { entry: StoredEntry, is_stale: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub broker_connected: bool,
    pub zone_count: usize,
    pub fresh_zone_count: usize,
    pub last_update: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneSummary {
    pub entry: StoredEntry,
    pub is_stale: bool,
}

#[derive(Clone)]
pub struct QueryService {
    store: ReadingStore,
    session: watch::Receiver<SessionState>,
    threshold: Duration,
}

impl QueryService {
    pub fn new(
        store: ReadingStore,
        session: watch::Receiver<SessionState>,
        threshold: Duration,
    ) -> Self {
        Self {
            store,
            session,
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn broker_connected(&self) -> bool {
        *self.session.borrow() == SessionState::Subscribed
    }

    pub async fn get_zone(&self, key: &ZoneKey) -> ZoneQuery {
        self.get_zone_at(key, OffsetDateTime::now_utc()).await
    }

    pub async fn get_zone_at(&self, key: &ZoneKey, now: OffsetDateTime) -> ZoneQuery {
        match self.store.get(key).await {
            Some(entry) => ZoneQuery::Found {
                is_stale: entry.is_stale(now, self.threshold),
                entry,
            },
            None => ZoneQuery::NotFound,
        }
    }

    pub async fn get_status(&self) -> StatusReport {
        self.get_status_at(OffsetDateTime::now_utc()).await
    }

    pub async fn get_status_at(&self, now: OffsetDateTime) -> StatusReport {
        let entries = self.store.entries().await;
        StatusReport {
            broker_connected: self.broker_connected(),
            zone_count: entries.len(),
            fresh_zone_count: entries
                .iter()
                .filter(|e| !e.is_stale(now, self.threshold))
                .count(),
            last_update: entries.iter().map(|e| e.received_at).max(),
        }
    }

    pub async fn known_zones(&self) -> Vec<ZoneKey> {
        self.store.all_keys().await.into_iter().collect()
    }

    pub async fn list_zones(&self) -> Vec<ZoneSummary> {
        self.list_zones_at(OffsetDateTime::now_utc()).await
    }

    pub async fn list_zones_at(&self, now: OffsetDateTime) -> Vec<ZoneSummary> {
        self.store
            .entries()
            .await
            .into_iter()
            .map(|entry| ZoneSummary {
                is_stale: entry.is_stale(now, self.threshold),
                entry,
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
