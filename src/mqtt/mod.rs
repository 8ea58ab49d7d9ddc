//! Shared MQTT connection pool and per-topic delivery queues.

mod pool;
mod queue;

pub use pool::{ConnState, ConnectionKey, MqttPool, PoolError};
pub use queue::TopicQueue;
