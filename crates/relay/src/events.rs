use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Events kept before the oldest is dropped.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct IngestEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connected,
    Subscribed,
    Disconnected,
    Rejected,
    Error,
    System,
}

/// Bounded log of broker and ingest events, oldest dropped first.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<RwLock<VecDeque<IngestEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, kind: EventKind, detail: impl Into<String>) {
        let mut events = self.events.write().await;
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(IngestEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail: detail.into(),
        });
    }

    /// Newest first.
    pub async fn recent(&self) -> Vec<IngestEvent> {
        self.events.read().await.iter().rev().cloned().collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recent_is_newest_first() {
        let log = EventLog::new();
        log.record(EventKind::Connected, "first").await;
        log.record(EventKind::Rejected, "second").await;

        let events = log.recent().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].detail, "second");
        assert_eq!(events[0].kind, EventKind::Rejected);
        assert_eq!(events[1].detail, "first");
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest() {
        let log = EventLog::new();
        for i in 0..MAX_EVENTS + 5 {
            log.record(EventKind::System, format!("event {i}")).await;
        }

        let events = log.recent().await;
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(events[0].detail, format!("event {}", MAX_EVENTS + 4));
        assert_eq!(events[MAX_EVENTS - 1].detail, "event 5");
    }

    #[test]
    fn event_serializes_lowercase_kind() {
        let ev = IngestEvent {
            ts: time::macros::datetime!(2025-06-01 12:00:00 UTC),
            kind: EventKind::Disconnected,
            detail: "broker closed connection".into(),
        };
        let json = serde_json::to_value(ev).unwrap();
        assert_eq!(json["kind"], "disconnected");
        assert_eq!(json["ts"], "2025-06-01T12:00:00Z");
    }
}
