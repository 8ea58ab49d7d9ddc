//! Publishing device settings through the shared MQTT pool.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::ingress::{resolve_mqtt, ConfigError};
use crate::model::Device;
use crate::mqtt::MqttPool;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error("mqtt publish failed: {0}")]
    Unavailable(String),
}

/// Timer settings a meter accepts on its publish topic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimerSettings {
    #[serde(rename = "timerEnable")]
    pub timer_enable: u8,
    #[serde(rename = "timerInterval")]
    pub timer_interval: u32,
}

impl TimerSettings {
    /// `timerEnable` is a 0/1 flag; the interval is clamped by the device to
    /// [5, 86400] seconds, so reject anything outside up front.
    pub fn validate(&self) -> Result<(), String> {
        if self.timer_enable > 1 {
            return Err("timerEnable must be 0 or 1".into());
        }
        if !(5..=86_400).contains(&self.timer_interval) {
            return Err("timerInterval must be within [5, 86400]".into());
        }
        Ok(())
    }
}

/// Publishes the settings payload on the device's pub topic, QoS 0, not
/// retained. The device must be MQTT with a complete broker config.
pub async fn publish_settings(
    pool: &MqttPool,
    device: &Device,
    settings: TimerSettings,
) -> Result<(), PublishError> {
    let endpoint = resolve_mqtt(device)?;
    let pub_topic = endpoint
        .pub_topic
        .ok_or(ConfigError::MissingMqtt("pub_topic"))?;

    let payload = json!({
        "timerEnable": settings.timer_enable,
        "timerInterval": settings.timer_interval,
    });
    pool.publish(&endpoint.key, &pub_topic, &payload)
        .await
        .map_err(|err| PublishError::Unavailable(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::test_device;
    use crate::model::IngressType;
    use crate::registry::SubscriberRegistry;
    use crate::retry::RetryPolicy;
    use crate::store::Store;
    use std::sync::Arc;

    async fn pool() -> MqttPool {
        let store = Store::in_memory().await.unwrap();
        MqttPool::new(
            Arc::new(SubscriberRegistry::new()),
            store,
            RetryPolicy::default(),
        )
    }

    #[test]
    fn timer_settings_validation() {
        assert!(TimerSettings {
            timer_enable: 1,
            timer_interval: 60
        }
        .validate()
        .is_ok());
        assert!(TimerSettings {
            timer_enable: 2,
            timer_interval: 60
        }
        .validate()
        .is_err());
        assert!(TimerSettings {
            timer_enable: 0,
            timer_interval: 4
        }
        .validate()
        .is_err());
        assert!(TimerSettings {
            timer_enable: 0,
            timer_interval: 86_401
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn non_mqtt_device_is_invalid_config() {
        let pool = pool().await;
        let mut device = test_device();
        device.ingress_type = IngressType::Tcp;
        let err = publish_settings(
            &pool,
            &device,
            TimerSettings {
                timer_enable: 1,
                timer_interval: 60,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PublishError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn missing_pub_topic_is_invalid_config() {
        let pool = pool().await;
        let mut device = test_device();
        device.pub_topic.clear();
        let err = publish_settings(
            &pool,
            &device,
            TimerSettings {
                timer_enable: 1,
                timer_interval: 60,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            PublishError::InvalidConfig(ConfigError::MissingMqtt("pub_topic"))
        ));
    }
}
