//! MQTT ingest session: keeps a subscription alive and feeds every publish
//! through the decoder into the [`ReadingStore`].
//!
//! ## Connection state machine
//!
//! ```text
//! Disconnected ──[start]──▶ Connecting ──[CONNACK + SUBACK ok]──▶ Subscribed
//!    ▲    │                    ▲   │                                  │
//!    │    └───[after delay]────┘   │                                  │
//!    └──────────[transport error or SUBACK rejected]─────────────────┘
//!                         (retry after reconnect delay)
//! ```
//!
//! A rejected SUBACK leaves the TCP connection up: the session reports
//! `Disconnected`, keeps polling so pings still go out, and resubscribes
//! once the delay has passed.
//!
//! Every failure takes the same path: log, wait, try again. The loop only
//! ends when the shutdown token fires.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubAck, SubscribeFilter, SubscribeReasonCode,
};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttSettings;
use crate::decode::{decode, DecodeError};
use crate::events::{EventKind, EventLog};
use crate::reading::ZoneKey;
use crate::store::ReadingStore;

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 20;

/// Upper bound on flushing UNSUBSCRIBE/DISCONNECT at shutdown.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// State + reconnect policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay after every failure.
    Fixed(Duration),
    /// Doubles per consecutive failure, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures
    /// (the first failure is 1).
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, max } => {
                let factor = 1u32
                    .checked_shl(failures.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// How a retry delay with a live connection ended.
enum RetryWait {
    Elapsed,
    Shutdown,
    Dropped(ConnectionError),
}

/// `true` when the broker granted every requested filter.
pub fn suback_granted(ack: &SubAck) -> bool {
    !ack.return_codes.is_empty()
        && ack
            .return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct IngestSession {
    options: MqttOptions,
    topics: Vec<String>,
    policy: ReconnectPolicy,
    store: ReadingStore,
    events: EventLog,
    state: watch::Sender<SessionState>,
    failures: u32,
    /// TCP link is up, whether or not the subscription was granted.
    connected: bool,
}

impl IngestSession {
    /// Build a session plus a receiver that always holds its current state.
    pub fn new(
        settings: &MqttSettings,
        store: ReadingStore,
        events: EventLog,
    ) -> (Self, watch::Receiver<SessionState>) {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);

        let (state, state_rx) = watch::channel(SessionState::Disconnected);
        let session = Self {
            options,
            topics: settings.topics.clone(),
            policy: settings.reconnect,
            store,
            events,
            state,
            failures: 0,
            connected: false,
        };
        (session, state_rx)
    }

    /// Run until `shutdown` fires. Never returns early on broker errors.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let (host, port) = self.options.broker_address();
        info!(broker = %format!("{host}:{port}"), topics = ?self.topics, "mqtt session starting");
        self.set_state(SessionState::Connecting);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    self.handle_publish(&p.topic, &p.payload).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    self.connected = true;
                    self.events
                        .record(EventKind::Connected, "broker accepted connection")
                        .await;
                    self.subscribe(&client).await;
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if suback_granted(&ack) {
                        self.on_subscribed().await;
                        continue;
                    }
                    warn!(codes = ?ack.return_codes, "mqtt subscribe rejected");
                    self.events
                        .record(
                            EventKind::Error,
                            format!("subscribe rejected: {:?}", ack.return_codes),
                        )
                        .await;
                    self.on_transport_error("broker rejected subscription").await;

                    match self.wait_polling(&mut eventloop, &shutdown).await {
                        RetryWait::Shutdown => break,
                        RetryWait::Elapsed => {
                            self.set_state(SessionState::Connecting);
                            self.subscribe(&client).await;
                        }
                        RetryWait::Dropped(e) => {
                            self.connected = false;
                            self.on_transport_error(&e).await;
                            if !self.wait_before_retry(&shutdown).await {
                                break;
                            }
                            self.set_state(SessionState::Connecting);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.connected = false;
                    self.on_transport_error("broker sent DISCONNECT").await;
                }
                Ok(_) => {}
                Err(e) => {
                    self.connected = false;
                    self.on_transport_error(&e).await;
                    if !self.wait_before_retry(&shutdown).await {
                        break;
                    }
                    // The next poll reconnects.
                    self.set_state(SessionState::Connecting);
                }
            }
        }

        self.close(client, eventloop).await;
    }

    // -- Inbound messages ---------------------------------------------------

    /// Decode one publish and store it. Decode failures leave the store
    /// untouched.
    pub async fn ingest(&self, topic: &str, payload: &[u8]) -> Result<ZoneKey, DecodeError> {
        let reading = decode(topic, payload)?;
        let key = reading.key();
        debug!(
            key = %key,
            current_ma = reading.current_ma,
            voltage_v = reading.voltage_v,
            power_mw = reading.power_mw,
            "reading stored"
        );
        self.store
            .upsert(key.clone(), reading, OffsetDateTime::now_utc())
            .await;
        Ok(key)
    }

    /// [`ingest`](Self::ingest), logging and dropping rejected payloads.
    async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self.ingest(topic, payload).await {
            warn!(topic, fields = ?e.fields(), "dropping telemetry: {e}");
            self.events
                .record(EventKind::Rejected, format!("{topic}: {e}"))
                .await;
        }
    }

    // -- Connection lifecycle -----------------------------------------------

    async fn subscribe(&self, client: &AsyncClient) {
        let filters = self
            .topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), QoS::AtLeastOnce));
        if let Err(e) = client.subscribe_many(filters).await {
            error!("mqtt subscribe request failed: {e}");
        }
    }

    async fn on_subscribed(&mut self) {
        self.failures = 0;
        self.set_state(SessionState::Subscribed);
        info!(topics = ?self.topics, "mqtt subscribed");
        self.events
            .record(EventKind::Subscribed, format!("subscribed to {}", self.topics.join(", ")))
            .await;
    }

    async fn on_transport_error(&mut self, reason: impl std::fmt::Display) {
        let was = *self.state.borrow();
        self.set_state(SessionState::Disconnected);
        warn!(?was, "mqtt connection lost: {reason}");
        self.events
            .record(EventKind::Disconnected, reason.to_string())
            .await;
    }

    /// Count one more failure and return the delay before the next attempt.
    fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.policy.delay(self.failures);
        info!(attempt = self.failures, ?delay, "mqtt retrying after delay");
        delay
    }

    /// Sleep for the policy delay with no live connection. Returns `false`
    /// if shutdown fired first.
    async fn wait_before_retry(&mut self, shutdown: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Sleep for the policy delay while the connection is still open,
    /// polling the event loop so keep-alive pings keep flowing.
    async fn wait_polling(
        &mut self,
        eventloop: &mut EventLoop,
        shutdown: &CancellationToken,
    ) -> RetryWait {
        let sleep = tokio::time::sleep(self.next_delay());
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return RetryWait::Shutdown,
                _ = &mut sleep => return RetryWait::Elapsed,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        self.handle_publish(&p.topic, &p.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => return RetryWait::Dropped(e),
                },
            }
        }
    }

    /// Best-effort UNSUBSCRIBE + DISCONNECT, bounded by [`SHUTDOWN_FLUSH`].
    async fn close(&self, client: AsyncClient, mut eventloop: EventLoop) {
        if self.connected {
            if *self.state.borrow() == SessionState::Subscribed {
                for topic in &self.topics {
                    let _ = client.try_unsubscribe(topic.clone());
                }
            }
            let _ = client.try_disconnect();

            let flush = async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if tokio::time::timeout(SHUTDOWN_FLUSH, flush).await.is_err() {
                debug!("mqtt disconnect flush timed out");
            }
        }

        self.set_state(SessionState::Disconnected);
        info!("mqtt session stopped");
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!(from = ?*current, to = ?next, "mqtt session state");
                *current = next;
                true
            }
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
