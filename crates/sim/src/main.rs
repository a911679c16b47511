mod sim;

use std::{env, future::Future, time::Duration};

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Dropout, PowerSim, Sample, Scenario};

/// Upper bound on letting the eventloop send DISCONNECT before exiting.
const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);

/// Wire format consumed by the relay.
#[derive(Debug, Serialize)]
struct Telemetry<'a> {
    node_id: &'a str,
    zone_id: &'a str,
    timestamp: u64,
    #[serde(rename = "current_mA")]
    current_ma: f64,
    #[serde(rename = "voltage_V")]
    voltage_v: f64,
    #[serde(rename = "power_mW")]
    power_mw: f64,
}

impl<'a> Telemetry<'a> {
    fn new(node_id: &'a str, zone_id: &'a str, timestamp: u64, s: Sample) -> Self {
        Self {
            node_id,
            zone_id,
            timestamp,
            current_ma: s.current_ma,
            voltage_v: s.voltage_v,
            power_mw: s.power_mw,
        }
    }
}

fn topic_for(node_id: &str, zone_id: &str) -> String {
    format!("/{node_id}/{zone_id}")
}

fn parse_zones(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|z| !z.is_empty())
        .map(String::from)
        .collect()
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// MQTT plumbing
// ---------------------------------------------------------------------------

/// Publish-only, but the eventloop must run to keep the connection alive.
/// The task ends once our DISCONNECT has gone out.
fn spawn_eventloop(mut eventloop: EventLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("sim connected to mqtt"),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

/// Publish unless `stop` resolves first; `None` means it did. `publish`
/// blocks once the request queue fills while the broker is down.
async fn publish_or_stop(
    client: &AsyncClient,
    topic: &str,
    payload: Vec<u8>,
    stop: impl Future<Output = ()>,
) -> Option<Result<(), ClientError>> {
    tokio::select! {
        res = client.publish(topic, QoS::AtLeastOnce, false, payload) => Some(res),
        _ = stop => None,
    }
}

/// Queue DISCONNECT and give the eventloop [`DISCONNECT_FLUSH`] to send it.
/// Returns `true` if it went out.
async fn disconnect(client: &AsyncClient, poller: JoinHandle<()>) -> bool {
    if let Err(e) = client.try_disconnect() {
        warn!("disconnect failed: {e}");
        return false;
    }
    matches!(timeout(DISCONNECT_FLUSH, poller).await, Ok(Ok(())))
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node1".to_string());
    let mut zones = parse_zones(&env::var("ZONES").unwrap_or_default());
    if zones.is_empty() {
        zones.push("zone1".to_string());
    }
    let sample_every = Duration::from_secs(env_or("SAMPLE_EVERY_S", 3u64).max(1));
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let mut dropout = match scenario {
        Scenario::Dropout => Some(Dropout::new(
            env_or("DROPOUT_AFTER", 20),
            Duration::from_secs(env_or("DROPOUT_SECS", 30)),
        )),
        _ => None,
    };

    let mut mqttoptions = MqttOptions::new(format!("microgrid-sim-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, eventloop) = AsyncClient::new(mqttoptions, 10);
    let poller = spawn_eventloop(eventloop);

    let mut power = PowerSim::new(scenario, zones.len());
    let started = Instant::now();
    info!(
        node = %node_id,
        zones = ?zones,
        channels = power.channel_count(),
        %scenario,
        every_s = sample_every.as_secs(),
        "publishing simulated readings"
    );

    'run: loop {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        for (i, zone_id) in zones.iter().enumerate() {
            let msg = Telemetry::new(&node_id, zone_id, elapsed_ms, power.sample(i));
            let payload = serde_json::to_vec(&msg).context("encode telemetry")?;
            let topic = topic_for(&node_id, zone_id);

            let Some(published) = publish_or_stop(&client, &topic, payload, ctrl_c()).await
            else {
                break 'run;
            };
            match published {
                Ok(()) => info!(
                    %topic,
                    current_ma = msg.current_ma,
                    voltage_v = msg.voltage_v,
                    "published"
                ),
                Err(e) => warn!(%topic, "publish error: {e}"),
            }
        }

        if let Some(pause) = dropout.as_mut().and_then(Dropout::record_sent) {
            info!(secs = pause.as_secs(), "dropout: going silent");
            tokio::select! {
                _ = sleep(pause) => info!("dropout over, resuming"),
                _ = ctrl_c() => break 'run,
            }
        }

        tokio::select! {
            _ = sleep(sample_every) => {}
            _ = ctrl_c() => break 'run,
        }
    }

    if !disconnect(&client, poller).await {
        warn!("mqtt disconnect not flushed");
    }
    info!("sim stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sample {
        Sample {
            current_ma: 1187.3,
            voltage_v: 15.02,
            power_mw: 17833.2,
        }
    }

    #[test]
    fn telemetry_uses_wire_field_names() {
        let msg = Telemetry::new("node1", "zone1", 4200, sample());
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["node_id"], "node1");
        assert_eq!(json["zone_id"], "zone1");
        assert_eq!(json["timestamp"], 4200);
        assert_eq!(json["current_mA"], 1187.3);
        assert_eq!(json["voltage_V"], 15.02);
        assert_eq!(json["power_mW"], 17833.2);
        // Exactly the six wire fields, no extras
        assert_eq!(json.as_object().unwrap().len(), 6);
    }

    #[test]
    fn topic_is_node_then_zone() {
        assert_eq!(topic_for("node1", "zone2"), "/node1/zone2");
    }

    #[test]
    fn parse_zones_trims_and_skips_blanks() {
        assert_eq!(parse_zones("zone1, zone2,,zone3 "), ["zone1", "zone2", "zone3"]);
        assert!(parse_zones("").is_empty());
        assert!(parse_zones(" , ").is_empty());
    }

    #[test]
    fn env_or_falls_back_on_missing() {
        assert_eq!(env_or("MICROGRID_SIM_TEST_UNSET_VAR", 7u64), 7);
    }

    // -- MQTT plumbing ------------------------------------------------------

    #[tokio::test]
    async fn publish_gives_way_to_stop_when_queue_is_full() {
        // Nothing polls the eventloop, so the single request slot never drains.
        let opts = MqttOptions::new("sim-test", "127.0.0.1", 1);
        let (client, _eventloop) = AsyncClient::new(opts, 1);
        client.try_publish("/node1/zone1", QoS::AtMostOnce, false, vec![1]).unwrap();

        let result = timeout(
            Duration::from_secs(5),
            publish_or_stop(&client, "/node1/zone1", vec![2], sleep(Duration::from_millis(50))),
        )
        .await
        .expect("stop future ends the blocked publish");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn publish_goes_through_when_queue_has_room() {
        let opts = MqttOptions::new("sim-test", "127.0.0.1", 1);
        let (client, _eventloop) = AsyncClient::new(opts, 4);
        let result =
            publish_or_stop(&client, "/node1/zone1", vec![1], std::future::pending()).await;
        assert!(matches!(result, Some(Ok(()))));
    }

    #[tokio::test]
    async fn disconnect_is_flushed_before_exit() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // CONNECT: header byte, one-byte remaining length, body.
            let _header = sock.read_u8().await.unwrap();
            let len = sock.read_u8().await.unwrap();
            let mut body = vec![0; len as usize];
            sock.read_exact(&mut body).await.unwrap();
            sock.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            // Next packet is the DISCONNECT.
            sock.read_u8().await.unwrap()
        });

        let opts = MqttOptions::new("sim-test", "127.0.0.1", port);
        let (client, eventloop) = AsyncClient::new(opts, 10);
        let poller = spawn_eventloop(eventloop);

        assert!(disconnect(&client, poller).await);
        let header = timeout(Duration::from_secs(5), broker)
            .await
            .expect("broker got a packet")
            .unwrap();
        assert_eq!(header, 0xE0);
    }

    #[tokio::test]
    async fn disconnect_gives_up_without_a_broker() {
        let opts = MqttOptions::new("sim-test", "127.0.0.1", 1);
        let (client, eventloop) = AsyncClient::new(opts, 10);
        let poller = spawn_eventloop(eventloop);

        let started = Instant::now();
        assert!(!disconnect(&client, poller).await);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
