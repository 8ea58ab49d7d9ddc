//! Ingress adapters: how a worker receives envelopes for its device.
//!
//! MQTT devices drain a per-topic queue owned by the shared connection pool;
//! TCP devices read line-delimited JSON directly. Construction validates the
//! device's ingress configuration so admin mistakes surface as
//! [`ConfigError`] instead of doomed connection attempts.

use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;

use crate::model::{Device, Envelope, IngressType};
use crate::mqtt::{ConnectionKey, MqttPool, TopicQueue};
use crate::registry::SubscriberRegistry;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::tcp::TcpIngress;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("mqtt config missing {0}")]
    MissingMqtt(&'static str),
    #[error("tcp config missing {0}")]
    MissingTcp(&'static str),
    #[error("device ingress type is not mqtt")]
    NotMqtt,
}

/// Resolved MQTT endpoint for a device: the pooled-connection identity plus
/// the two topics the device exchanges data on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub key: ConnectionKey,
    pub sub_topic: Option<String>,
    pub pub_topic: Option<String>,
}

/// Builds the connection key and topics from a device row. `broker`, `port`
/// and `client_id` are always required; topic requirements depend on whether
/// the caller subscribes or publishes.
pub fn resolve_mqtt(device: &Device) -> Result<MqttEndpoint, ConfigError> {
    if device.ingress_type != IngressType::Mqtt {
        return Err(ConfigError::NotMqtt);
    }
    if device.broker.is_empty() {
        return Err(ConfigError::MissingMqtt("broker"));
    }
    if device.port == 0 {
        return Err(ConfigError::MissingMqtt("port"));
    }
    if device.client_id.is_empty() {
        return Err(ConfigError::MissingMqtt("client_id"));
    }

    let none_if_empty = |s: &str| {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    };
    Ok(MqttEndpoint {
        key: ConnectionKey {
            host: device.broker.clone(),
            port: device.port,
            username: device.username.clone(),
            password: device.password.clone(),
            client_id: device.client_id.clone(),
        },
        sub_topic: none_if_empty(&device.sub_topic),
        pub_topic: none_if_empty(&device.pub_topic),
    })
}

/// Dependencies an adapter needs besides the device row.
#[derive(Clone)]
pub struct IngressDeps {
    pub pool: Arc<MqttPool>,
    pub registry: Arc<SubscriberRegistry>,
    pub store: Store,
    pub policy: RetryPolicy,
}

pub enum Ingress {
    Mqtt(MqttIngress),
    Tcp(TcpIngress),
}

impl Ingress {
    /// Validates the device config and builds the matching adapter.
    pub fn create(device: &Device, deps: &IngressDeps) -> Result<Self, ConfigError> {
        match device.ingress_type {
            IngressType::Mqtt => {
                let endpoint = resolve_mqtt(device)?;
                let topic = endpoint
                    .sub_topic
                    .clone()
                    .ok_or(ConfigError::MissingMqtt("sub_topic"))?;
                Ok(Ingress::Mqtt(MqttIngress {
                    pool: Arc::clone(&deps.pool),
                    registry: Arc::clone(&deps.registry),
                    key: endpoint.key,
                    topic,
                    mac: device.mac.clone(),
                    queue: None,
                }))
            }
            IngressType::Tcp => {
                if device.broker.is_empty() {
                    return Err(ConfigError::MissingTcp("host"));
                }
                if device.port == 0 {
                    return Err(ConfigError::MissingTcp("port"));
                }
                Ok(Ingress::Tcp(TcpIngress::new(
                    device.broker.clone(),
                    device.port,
                    device.mac.clone(),
                    deps.policy,
                    Arc::clone(&deps.registry),
                    deps.store.clone(),
                )))
            }
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        match self {
            Ingress::Mqtt(mqtt) => mqtt.connect().await,
            Ingress::Tcp(tcp) => tcp.connect().await,
        }
    }

    /// Next envelope; `Ok(None)` signals the stream ended and the worker
    /// should cycle (only TCP streams end — topic queues live forever).
    pub async fn next(&mut self) -> Result<Option<Envelope>> {
        match self {
            Ingress::Mqtt(mqtt) => mqtt.next().await,
            Ingress::Tcp(tcp) => tcp.next().await,
        }
    }

    pub async fn disconnect(&mut self) {
        match self {
            Ingress::Mqtt(mqtt) => mqtt.disconnect().await,
            Ingress::Tcp(tcp) => tcp.disconnect().await,
        }
    }
}

/// MQTT adapter backed by the shared pool.
pub struct MqttIngress {
    pool: Arc<MqttPool>,
    registry: Arc<SubscriberRegistry>,
    key: ConnectionKey,
    topic: String,
    mac: String,
    queue: Option<Arc<TopicQueue>>,
}

impl MqttIngress {
    async fn connect(&mut self) -> Result<()> {
        let queue = self
            .pool
            .subscribe(&self.key, &self.topic, &self.mac)
            .await?;
        self.queue = Some(queue);
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Envelope>> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("mqtt ingress is not connected"))?;
        Ok(Some(queue.pop().await))
    }

    async fn disconnect(&mut self) {
        if self.queue.take().is_some() {
            self.pool.unsubscribe(&self.key, &self.topic).await;
        }
        self.registry.record_lag(&self.mac, 0.0).await;
    }
}
