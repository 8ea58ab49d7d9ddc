//! Pooled MQTT connections shared across device subscriptions.
//!
//! Devices whose broker, credentials and client id coincide share one
//! physical connection; a per-connection routing table fans inbound publishes
//! out to per-topic queues. The event task that polls the rumqttc event loop
//! doubles as the reconnect loop: poll errors count attempts under the retry
//! policy, and every successful ConnAck re-issues SUBSCRIBE for the whole
//! routing table (the broker forgets subscriptions for clean sessions).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::queue::{TopicQueue, DEFAULT_QUEUE_CAPACITY};
use crate::model::{normalize_mac, Envelope};
use crate::registry::SubscriberRegistry;
use crate::retry::RetryPolicy;
use crate::store::Store;

/// MQTT keepalive for pooled connections.
const KEEPALIVE: Duration = Duration::from_secs(30);

/// Capacity of the rumqttc request channel between client and event loop.
const EVENT_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("topic {topic} is already bound to {existing}")]
    BindingConflict { topic: String, existing: String },
    #[error("mqtt connection unavailable: {0}")]
    Connection(String),
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Identity of a physical connection. Two subscriptions share a connection
/// iff every field matches; a different client id must never share a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

/// Connection lifecycle as observed through the state watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// One topic→consumer binding inside a connection's routing table.
#[derive(Debug, Clone)]
pub(crate) struct TopicSubscription {
    pub(crate) mac: String,
    pub(crate) queue: Arc<TopicQueue>,
}

type RoutingTable = HashMap<String, TopicSubscription>;

struct PooledConnection {
    client: AsyncClient,
    topics: Arc<Mutex<RoutingTable>>,
    state: watch::Receiver<ConnState>,
    stop: Arc<AtomicBool>,
}

impl PooledConnection {
    /// Waits until the connection is live. Fails once the event task has
    /// given up (max reconnect attempts) or the connection was closed.
    async fn ensure_connected(&self) -> Result<(), PoolError> {
        let mut state = self.state.clone();
        loop {
            match *state.borrow_and_update() {
                ConnState::Connected => return Ok(()),
                ConnState::Closed => {
                    return Err(PoolError::Connection("connection closed".into()))
                }
                ConnState::Connecting | ConnState::Reconnecting => {}
            }
            if state.changed().await.is_err() {
                return Err(PoolError::Connection("connection task exited".into()));
            }
        }
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnState::Connected
    }
}

type ConnectionTable = Arc<Mutex<HashMap<ConnectionKey, Arc<PooledConnection>>>>;

/// The shared pool. One instance serves both the ingestion workers and the
/// admin publish path.
pub struct MqttPool {
    connections: ConnectionTable,
    registry: Arc<SubscriberRegistry>,
    store: Store,
    policy: RetryPolicy,
    queue_capacity: usize,
}

impl MqttPool {
    pub fn new(registry: Arc<SubscriberRegistry>, store: Store, policy: RetryPolicy) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            registry,
            store,
            policy,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Binds `topic` to `mac` on the keyed connection and returns the queue
    /// the worker should drain. Subscribing the same (topic, mac) twice
    /// returns the existing queue; a different MAC is a binding conflict.
    pub async fn subscribe(
        &self,
        key: &ConnectionKey,
        topic: &str,
        mac: &str,
    ) -> Result<Arc<TopicQueue>, PoolError> {
        let conn = self.get_or_create(key).await;
        conn.ensure_connected().await?;

        let mut topics = conn.topics.lock().await;
        if let Some(existing) = topics.get(topic) {
            if existing.mac == mac {
                return Ok(Arc::clone(&existing.queue));
            }
            return Err(PoolError::BindingConflict {
                topic: topic.to_string(),
                existing: existing.mac.clone(),
            });
        }

        let queue = Arc::new(TopicQueue::new(self.queue_capacity));
        topics.insert(
            topic.to_string(),
            TopicSubscription {
                mac: mac.to_string(),
                queue: Arc::clone(&queue),
            },
        );
        // If we are between ConnAck and the next reconnect, the resubscribe
        // pass will pick the topic up from the routing table instead.
        if conn.is_connected() {
            conn.client.subscribe(topic, QoS::AtMostOnce).await?;
        }
        info!(topic, mac, client_id = %key.client_id, "topic subscribed");
        Ok(queue)
    }

    /// Removes the binding; the last topic on a connection tears the
    /// physical connection down.
    pub async fn unsubscribe(&self, key: &ConnectionKey, topic: &str) {
        let Some(conn) = self.connections.lock().await.get(key).cloned() else {
            return;
        };
        let mut topics = conn.topics.lock().await;
        if topics.remove(topic).is_some() && conn.is_connected() {
            let _ = conn.client.unsubscribe(topic).await;
        }
        let empty = topics.is_empty();
        drop(topics);
        if empty {
            debug!(client_id = %key.client_id, "last topic removed, closing connection");
            self.close(key, &conn).await;
        }
    }

    /// Publishes a compact-JSON payload at QoS 0, not retained. Connections
    /// opened only for publishing are closed again afterwards.
    pub async fn publish(
        &self,
        key: &ConnectionKey,
        topic: &str,
        payload: &Value,
    ) -> Result<(), PoolError> {
        let conn = self.get_or_create(key).await;
        conn.ensure_connected().await?;
        let body = serde_json::to_vec(payload)?;
        conn.client
            .publish(topic, QoS::AtMostOnce, false, body)
            .await?;
        info!(topic, client_id = %key.client_id, "settings published");

        let idle = conn.topics.lock().await.is_empty();
        if idle {
            self.close(key, &conn).await;
        }
        Ok(())
    }

    /// Tears down every pooled connection.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = {
            let mut table = self.connections.lock().await;
            table.drain().collect()
        };
        for (_, conn) in connections {
            conn.stop.store(true, Ordering::SeqCst);
            let _ = conn.client.disconnect().await;
        }
    }

    /// Creation is serialized by the connection-table lock, which makes the
    /// first-connect path idempotent under concurrency: one caller spawns the
    /// event task, everyone else awaits the state channel.
    async fn get_or_create(&self, key: &ConnectionKey) -> Arc<PooledConnection> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(key) {
            if *existing.state.borrow() != ConnState::Closed {
                return Arc::clone(existing);
            }
        }

        let mut options = MqttOptions::new(&key.client_id, &key.host, key.port);
        options.set_keep_alive(KEEPALIVE);
        if !key.username.is_empty() {
            options.set_credentials(&key.username, &key.password);
        }
        let (client, eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);

        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
        let conn = Arc::new(PooledConnection {
            client: client.clone(),
            topics: Arc::new(Mutex::new(HashMap::new())),
            state: state_rx,
            stop: Arc::new(AtomicBool::new(false)),
        });
        connections.insert(key.clone(), Arc::clone(&conn));

        tokio::spawn(drive_connection(DriveContext {
            key: key.clone(),
            client,
            eventloop,
            state: state_tx,
            topics: Arc::clone(&conn.topics),
            stop: Arc::clone(&conn.stop),
            registry: Arc::clone(&self.registry),
            store: self.store.clone(),
            policy: self.policy,
            connections: Arc::clone(&self.connections),
        }));
        conn
    }

    async fn close(&self, key: &ConnectionKey, conn: &Arc<PooledConnection>) {
        conn.stop.store(true, Ordering::SeqCst);
        let _ = conn.client.disconnect().await;
        let mut connections = self.connections.lock().await;
        if let Some(entry) = connections.get(key) {
            if Arc::ptr_eq(entry, conn) {
                connections.remove(key);
            }
        }
    }
}

struct DriveContext {
    key: ConnectionKey,
    client: AsyncClient,
    eventloop: EventLoop,
    state: watch::Sender<ConnState>,
    topics: Arc<Mutex<RoutingTable>>,
    stop: Arc<AtomicBool>,
    registry: Arc<SubscriberRegistry>,
    store: Store,
    policy: RetryPolicy,
    connections: ConnectionTable,
}

/// Event task: polls the event loop, routes publishes, resubscribes on every
/// ConnAck and backs off on errors until the retry policy is exhausted.
async fn drive_connection(mut ctx: DriveContext) {
    let mut attempt: u32 = 0;
    loop {
        match ctx.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    warn!(client_id = %ctx.key.client_id, code = ?ack.code, "broker rejected connection");
                    if ctx.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    attempt += 1;
                    if ctx.policy.wait(attempt).await.is_err() {
                        break;
                    }
                    continue;
                }
                attempt = 0;
                let _ = ctx.state.send(ConnState::Connected);
                let plan = resubscribe_plan(&*ctx.topics.lock().await);
                for (topic, mac) in plan {
                    let _ = ctx.client.subscribe(&topic, QoS::AtMostOnce).await;
                    ctx.registry.record_reconnect(&mac);
                }
                info!(client_id = %ctx.key.client_id, "mqtt connected");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let outcome = {
                    let topics = ctx.topics.lock().await;
                    route_publish(&topics, &publish.topic, &publish.payload)
                };
                match outcome {
                    RouteOutcome::Delivered { mac, shed } => {
                        ctx.registry.record_ingress(&mac);
                        if let Some(shed) = shed {
                            record_drop(&ctx, "backpressure", Some(shed.mac), Value::Object(shed.payload));
                        }
                    }
                    RouteOutcome::Dropped { reason, mac, raw } => {
                        warn!(topic = %publish.topic, reason, "inbound message dropped");
                        record_drop(&ctx, reason, mac, raw);
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                if ctx.stop.load(Ordering::SeqCst) {
                    break;
                }
                let _ = ctx.state.send(ConnState::Reconnecting);
                attempt += 1;
                warn!(
                    client_id = %ctx.key.client_id,
                    attempt,
                    error = %err,
                    "mqtt connection error, backing off"
                );
                let reason = error_reason(&err);
                for (_, sub) in ctx.topics.lock().await.iter() {
                    ctx.registry.record_retry_failure(&sub.mac, reason);
                }
                if ctx.policy.wait(attempt).await.is_err() {
                    warn!(client_id = %ctx.key.client_id, "max reconnect attempts reached, giving up");
                    break;
                }
            }
        }
    }

    let _ = ctx.state.send(ConnState::Closed);
    // Drop our table entry so later subscribers build a fresh connection.
    let mut connections = ctx.connections.lock().await;
    if let Some(entry) = connections.get(&ctx.key) {
        if Arc::ptr_eq(&entry.topics, &ctx.topics) {
            connections.remove(&ctx.key);
        }
    }
}

/// Records a transport-level drop: counter plus a best-effort dead-letter
/// row. The write is spawned so routing never blocks on storage.
fn record_drop(ctx: &DriveContext, reason: &'static str, mac: Option<String>, raw: Value) {
    ctx.registry.record_dead_letter(reason);
    let store = ctx.store.clone();
    tokio::spawn(async move {
        let _ = store
            .append_dead_letter(None, mac.as_deref(), &raw, reason, false, None)
            .await;
    });
}

/// Topic/MAC pairs to re-SUBSCRIBE after a (re)connect.
fn resubscribe_plan(topics: &RoutingTable) -> Vec<(String, String)> {
    topics
        .iter()
        .map(|(topic, sub)| (topic.clone(), sub.mac.clone()))
        .collect()
}

fn error_reason(err: &ConnectionError) -> &'static str {
    match err {
        ConnectionError::Io(_) => "io_error",
        ConnectionError::NetworkTimeout => "network_timeout",
        _ => "connection_error",
    }
}

/// What the event task did with one inbound publish.
pub(crate) enum RouteOutcome {
    Delivered {
        mac: String,
        /// Oldest envelope shed by a full queue, to be dead-lettered.
        shed: Option<Envelope>,
    },
    Dropped {
        reason: &'static str,
        mac: Option<String>,
        raw: Value,
    },
}

/// Pure routing step: decode, look up the topic binding, check the MAC and
/// enqueue. Factored out of the event task so it can be exercised without a
/// broker.
pub(crate) fn route_publish(
    topics: &RoutingTable,
    topic: &str,
    payload: &[u8],
) -> RouteOutcome {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => {
            return RouteOutcome::Dropped {
                reason: "invalid_json",
                mac: None,
                raw: json!({ "raw": String::from_utf8_lossy(payload) }),
            }
        }
    };
    let Value::Object(map) = value else {
        return RouteOutcome::Dropped {
            reason: "invalid_json",
            mac: None,
            raw: value,
        };
    };

    let Some(sub) = topics.get(topic) else {
        return RouteOutcome::Dropped {
            reason: "unknown_topic",
            mac: None,
            raw: Value::Object(map),
        };
    };

    // A payload without a MAC inherits the subscription's; a present MAC
    // must match the binding after normalization.
    let mac = match map.get("mac") {
        None => Some(sub.mac.clone()),
        Some(Value::String(raw)) => normalize_mac(raw).filter(|mac| *mac == sub.mac),
        Some(_) => None,
    };
    let Some(mac) = mac else {
        return RouteOutcome::Dropped {
            reason: "mac_mismatch",
            mac: Some(sub.mac.clone()),
            raw: Value::Object(map),
        };
    };

    let shed = sub.queue.push(Envelope {
        mac: mac.clone(),
        payload: map,
    });
    RouteOutcome::Delivered { mac, shed }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(topic: &str, mac: &str, capacity: usize) -> (RoutingTable, Arc<TopicQueue>) {
        let queue = Arc::new(TopicQueue::new(capacity));
        let mut topics = RoutingTable::new();
        topics.insert(
            topic.to_string(),
            TopicSubscription {
                mac: mac.to_string(),
                queue: Arc::clone(&queue),
            },
        );
        (topics, queue)
    }

    #[test]
    fn routes_matching_message() {
        let (topics, queue) = table_with("device/sub", "AA0000000001", 8);
        let outcome = route_publish(&topics, "device/sub", br#"{"mac":"AA0000000001","energy":"1.0"}"#);
        match outcome {
            RouteOutcome::Delivered { mac, shed } => {
                assert_eq!(mac, "AA0000000001");
                assert!(shed.is_none());
            }
            RouteOutcome::Dropped { reason, .. } => panic!("unexpected drop: {reason}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn lowercase_mac_is_normalized_before_comparison() {
        let (topics, queue) = table_with("device/sub", "AA0000000001", 8);
        let outcome = route_publish(&topics, "device/sub", br#"{"mac":"aa0000000001"}"#);
        assert!(matches!(outcome, RouteOutcome::Delivered { .. }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn missing_mac_falls_back_to_binding() {
        let (topics, queue) = table_with("device/sub", "AA0000000001", 8);
        let outcome = route_publish(&topics, "device/sub", br#"{"energy":"1.0"}"#);
        match outcome {
            RouteOutcome::Delivered { mac, .. } => assert_eq!(mac, "AA0000000001"),
            RouteOutcome::Dropped { reason, .. } => panic!("unexpected drop: {reason}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drops_mac_mismatch() {
        let (topics, queue) = table_with("device/sub", "AA0000000001", 8);
        let outcome = route_publish(&topics, "device/sub", br#"{"mac":"AA0000000002"}"#);
        match outcome {
            RouteOutcome::Dropped { reason, mac, .. } => {
                assert_eq!(reason, "mac_mismatch");
                assert_eq!(mac.as_deref(), Some("AA0000000001"));
            }
            RouteOutcome::Delivered { .. } => panic!("mismatched mac must not deliver"),
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn drops_unknown_topic() {
        let (topics, _queue) = table_with("device/sub", "AA0000000001", 8);
        let outcome = route_publish(&topics, "other/sub", br#"{"mac":"AA0000000001"}"#);
        assert!(matches!(
            outcome,
            RouteOutcome::Dropped {
                reason: "unknown_topic",
                ..
            }
        ));
    }

    #[test]
    fn drops_invalid_json_and_non_objects() {
        let (topics, queue) = table_with("device/sub", "AA0000000001", 8);
        for payload in [&b"not json"[..], &br#"[1, 2, 3]"#[..]] {
            let outcome = route_publish(&topics, "device/sub", payload);
            assert!(matches!(
                outcome,
                RouteOutcome::Dropped {
                    reason: "invalid_json",
                    ..
                }
            ));
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn full_queue_sheds_oldest_as_backpressure() {
        let (topics, queue) = table_with("device/sub", "AA0000000001", 1);
        let first = route_publish(&topics, "device/sub", br#"{"seq":1}"#);
        assert!(matches!(first, RouteOutcome::Delivered { shed: None, .. }));
        let second = route_publish(&topics, "device/sub", br#"{"seq":2}"#);
        match second {
            RouteOutcome::Delivered { shed: Some(shed), .. } => {
                assert_eq!(shed.payload["seq"], 1);
            }
            _ => panic!("expected shed envelope"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn resubscribe_plan_covers_whole_routing_table() {
        let mut topics = RoutingTable::new();
        for (topic, mac) in [("t1", "AA0000000001"), ("t2", "AA0000000002")] {
            topics.insert(
                topic.to_string(),
                TopicSubscription {
                    mac: mac.to_string(),
                    queue: Arc::new(TopicQueue::new(4)),
                },
            );
        }
        let mut plan = resubscribe_plan(&topics);
        plan.sort();
        assert_eq!(
            plan,
            vec![
                ("t1".to_string(), "AA0000000001".to_string()),
                ("t2".to_string(), "AA0000000002".to_string()),
            ]
        );
    }

    #[test]
    fn connection_keys_differ_by_client_id() {
        let base = ConnectionKey {
            host: "broker.local".into(),
            port: 1883,
            username: "u".into(),
            password: "p".into(),
            client_id: "c1".into(),
        };
        let mut other = base.clone();
        other.client_id = "c2".into();
        assert_ne!(base, other);

        let mut table = HashMap::new();
        table.insert(base.clone(), 1);
        assert!(!table.contains_key(&other));
        assert!(table.contains_key(&base));
    }
}
