// MQTT adapters: telemetry subscription and Miniconf-style settings requests
use crate::application::config_rpc::{ConfigRpc, RpcError};
use crate::application::telemetry_feed::{TelemetryFeed, TelemetryStream};
use crate::infrastructure::config::BrokerSettings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties};
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 16;

fn mqtt_options(broker: &BrokerSettings, client_id: String) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
    options.set_keep_alive(KEEP_ALIVE);
    options
}

/// Poll until the broker acknowledges the pending subscription.
async fn await_suback(eventloop: &mut EventLoop, timeout: Duration) -> Result<()> {
    let acked = tokio::time::timeout(timeout, async {
        loop {
            if let Event::Incoming(Packet::SubAck(_)) = eventloop.poll().await? {
                return Ok::<_, ConnectionError>(());
            }
        }
    })
    .await;

    match acked {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e).context("MQTT connection failed"),
        Err(_) => anyhow::bail!("No subscription acknowledgement within {:?}", timeout),
    }
}

fn is_topic(publish: &Publish, topic: &str) -> bool {
    publish.topic.as_ref() == topic.as_bytes()
}

/// Opens a dedicated connection per subscription, so stopping a receiver
/// drops its connection and nothing lingers into the next setpoint.
pub struct MqttTelemetryFeed {
    broker: BrokerSettings,
    sessions: AtomicU64,
}

impl MqttTelemetryFeed {
    pub fn new(broker: BrokerSettings) -> Self {
        Self {
            broker,
            sessions: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl TelemetryFeed for MqttTelemetryFeed {
    async fn subscribe(&self, topic: &str) -> Result<TelemetryStream> {
        let session = self.sessions.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("{}-telemetry-{}", self.broker.client_id, session);
        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(&self.broker, client_id), REQUEST_CAPACITY);

        client
            .subscribe(topic.to_string(), QoS::AtMostOnce)
            .await
            .context("Failed to queue telemetry subscription")?;
        await_suback(&mut eventloop, self.broker.rpc_timeout())
            .await
            .with_context(|| format!("Failed to subscribe to {}", topic))?;

        tracing::debug!("Subscribed to {} on {}:{}", topic, self.broker.host, self.broker.port);

        let topic = topic.to_string();
        Ok(Box::pin(async_stream::stream! {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if is_topic(&publish, &topic) {
                            yield publish.payload;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // Reconnected with a clean session.
                        if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                            tracing::error!("Failed to resubscribe to {}: {}", topic, e);
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Telemetry connection error on {}: {}", topic, e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }))
    }
}

#[derive(Debug, Deserialize)]
struct MiniconfResponse {
    code: i64,
    #[serde(default)]
    msg: String,
}

impl MiniconfResponse {
    fn parse(payload: &[u8]) -> Self {
        serde_json::from_slice(payload).unwrap_or_else(|e| Self {
            code: -1,
            msg: format!("unreadable response: {}", e),
        })
    }
}

type PendingRequests = Arc<Mutex<HashMap<Bytes, oneshot::Sender<MiniconfResponse>>>>;

fn lock_pending(
    pending: &PendingRequests,
) -> MutexGuard<'_, HashMap<Bytes, oneshot::Sender<MiniconfResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Park a waiter for the response carrying `correlation`.
fn register(
    pending: &PendingRequests,
    correlation: Bytes,
) -> oneshot::Receiver<MiniconfResponse> {
    let (tx, rx) = oneshot::channel();
    lock_pending(pending).insert(correlation, tx);
    rx
}

/// Hand a response to its waiter. Returns `false` when nobody is waiting.
fn deliver(pending: &PendingRequests, correlation: &Bytes, payload: &[u8]) -> bool {
    match lock_pending(pending).remove(correlation) {
        Some(tx) => {
            let _ = tx.send(MiniconfResponse::parse(payload));
            true
        }
        None => false,
    }
}

/// Wait for the waiter registered under `correlation` and map the reply code.
async fn await_response(
    pending: &PendingRequests,
    correlation: &Bytes,
    rx: oneshot::Receiver<MiniconfResponse>,
    path: &str,
    timeout: Duration,
) -> Result<(), RpcError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(response)) => check_response(path, response),
        Ok(Err(_)) => Err(RpcError::Transport("settings connection closed".to_string())),
        Err(_) => {
            lock_pending(pending).remove(correlation);
            Err(RpcError::Timeout {
                path: path.to_string(),
                timeout,
            })
        }
    }
}

/// Code 0 is success; anything else is the controller refusing the value.
fn check_response(path: &str, response: MiniconfResponse) -> Result<(), RpcError> {
    if response.code == 0 {
        Ok(())
    } else {
        Err(RpcError::Rejected {
            path: path.to_string(),
            code: response.code,
            message: response.msg,
        })
    }
}

pub fn settings_topic(prefix: &str, path: &str) -> String {
    format!("{}/settings/{}", prefix, path)
}

/// Settings client: each write is published retained to
/// `{prefix}/settings/{path}` and answered on this client's response topic,
/// matched by correlation data.
pub struct MiniconfClient {
    client: AsyncClient,
    prefix: String,
    response_topic: String,
    timeout: Duration,
    pending: PendingRequests,
    next_request: AtomicU64,
    router: JoinHandle<()>,
}

impl MiniconfClient {
    pub async fn connect(broker: &BrokerSettings, prefix: &str) -> Result<Self> {
        let client_id = format!("{}-settings", broker.client_id);
        let response_topic = format!("{}/response/{}", prefix, client_id);
        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(broker, client_id), REQUEST_CAPACITY);

        client
            .subscribe(response_topic.clone(), QoS::AtMostOnce)
            .await
            .context("Failed to queue response subscription")?;
        await_suback(&mut eventloop, broker.rpc_timeout())
            .await
            .with_context(|| format!("Failed to reach settings broker {}:{}", broker.host, broker.port))?;

        tracing::info!("Settings client connected to {}:{}", broker.host, broker.port);

        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let router = tokio::spawn(route_responses(
            eventloop,
            client.clone(),
            response_topic.clone(),
            pending.clone(),
        ));

        Ok(Self {
            client,
            prefix: prefix.to_string(),
            response_topic,
            timeout: broker.rpc_timeout(),
            pending,
            next_request: AtomicU64::new(0),
            router,
        })
    }
}

async fn route_responses(
    mut eventloop: EventLoop,
    client: AsyncClient,
    response_topic: String,
    pending: PendingRequests,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if !is_topic(&publish, &response_topic) {
                    continue;
                }
                let Some(correlation) = publish
                    .properties
                    .as_ref()
                    .and_then(|p| p.correlation_data.clone())
                else {
                    tracing::warn!("Settings response without correlation data ignored");
                    continue;
                };
                if !deliver(&pending, &correlation, &publish.payload) {
                    tracing::debug!("Late settings response {:?} dropped", correlation);
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Err(e) = client.subscribe(response_topic.clone(), QoS::AtMostOnce).await {
                    tracing::error!("Failed to resubscribe to {}: {}", response_topic, e);
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Settings connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    // Waiters see their sender dropped and report a transport failure.
    lock_pending(&pending).clear();
}

#[async_trait]
impl ConfigRpc for MiniconfClient {
    async fn set(&self, path: &str, value: Value) -> Result<(), RpcError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let correlation = Bytes::from(id.to_string());
        let payload = serde_json::to_vec(&value).map_err(|e| RpcError::Transport(e.to_string()))?;

        let rx = register(&self.pending, correlation.clone());

        let properties = PublishProperties {
            response_topic: Some(self.response_topic.clone()),
            correlation_data: Some(correlation.clone()),
            ..Default::default()
        };
        let published = self
            .client
            .publish_with_properties(
                settings_topic(&self.prefix, path),
                QoS::AtMostOnce,
                true,
                payload,
                properties,
            )
            .await;
        if let Err(e) = published {
            lock_pending(&self.pending).remove(&correlation);
            return Err(RpcError::Transport(e.to_string()));
        }

        await_response(&self.pending, &correlation, rx, path, self.timeout).await?;

        tracing::debug!("Set {} = {}", path, value);
        Ok(())
    }
}

impl Drop for MiniconfClient {
    fn drop(&mut self) {
        self.router.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_topic() {
        assert_eq!(
            settings_topic("dt/sinara/thermostat-mqtt/80-1f-12-63-84-1a", "pidsettings/0/target"),
            "dt/sinara/thermostat-mqtt/80-1f-12-63-84-1a/settings/pidsettings/0/target"
        );
    }

    #[test]
    fn test_response_parsing() {
        let ok = MiniconfResponse::parse(br#"{"code":0,"msg":"OK"}"#);
        assert_eq!(ok.code, 0);
        assert_eq!(ok.msg, "OK");

        let rejected = MiniconfResponse::parse(br#"{"code":2,"msg":"Invalid value"}"#);
        assert_eq!(rejected.code, 2);

        let garbage = MiniconfResponse::parse(b"\x00\x01");
        assert_eq!(garbage.code, -1);
        assert!(garbage.msg.starts_with("unreadable response"));
    }

    fn pending() -> PendingRequests {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn test_responses_route_by_correlation() {
        let pending = pending();
        let first = register(&pending, Bytes::from_static(b"0"));
        let second = register(&pending, Bytes::from_static(b"1"));

        assert!(deliver(&pending, &Bytes::from_static(b"1"), br#"{"code":0,"msg":"OK"}"#));
        assert!(!deliver(&pending, &Bytes::from_static(b"7"), br#"{"code":0}"#));
        assert_eq!(lock_pending(&pending).len(), 1);

        let result = await_response(
            &pending,
            &Bytes::from_static(b"1"),
            second,
            "pidsettings/0/target",
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_ok());

        assert!(deliver(&pending, &Bytes::from_static(b"0"), br#"{"code":0}"#));
        assert!(first.await.is_ok());
        assert!(lock_pending(&pending).is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_code_is_rejected() {
        let pending = pending();
        let correlation = Bytes::from_static(b"3");
        let rx = register(&pending, correlation.clone());
        deliver(&pending, &correlation, br#"{"code":2,"msg":"Invalid value"}"#);

        let err = await_response(&pending, &correlation, rx, "engage_iir/0", Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            RpcError::Rejected { path, code, message } => {
                assert_eq!(path, "engage_iir/0");
                assert_eq!(code, 2);
                assert_eq!(message, "Invalid value");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let pending = pending();
        let correlation = Bytes::from_static(b"4");
        let rx = register(&pending, correlation.clone());

        let err = await_response(&pending, &correlation, rx, "pidsettings/0/pid/0", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(lock_pending(&pending).is_empty());

        // A reply arriving after the deadline finds nobody waiting.
        assert!(!deliver(&pending, &correlation, br#"{"code":0}"#));
    }

    #[tokio::test]
    async fn test_router_exit_is_a_transport_error() {
        let pending = pending();
        let correlation = Bytes::from_static(b"5");
        let rx = register(&pending, correlation.clone());

        lock_pending(&pending).clear();

        let err = await_response(&pending, &correlation, rx, "pidsettings/0/target", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
