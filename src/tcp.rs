//! Line-delimited TCP ingress: one JSON object per LF-terminated UTF-8 line.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::model::{normalize_mac, Envelope};
use crate::registry::SubscriberRegistry;
use crate::retry::RetryPolicy;
use crate::store::Store;

pub struct TcpIngress {
    host: String,
    port: u16,
    mac: String,
    policy: RetryPolicy,
    registry: Arc<SubscriberRegistry>,
    store: Store,
    reader: Option<BufReader<TcpStream>>,
}

impl TcpIngress {
    pub fn new(
        host: String,
        port: u16,
        mac: String,
        policy: RetryPolicy,
        registry: Arc<SubscriberRegistry>,
        store: Store,
    ) -> Self {
        Self {
            host,
            port,
            mac,
            policy,
            registry,
            store,
            reader: None,
        }
    }

    /// Opens the stream, retrying with backoff up to the policy's limit.
    pub async fn connect(&mut self) -> Result<()> {
        for attempt in 1..=self.policy.max_attempts {
            match TcpStream::connect((self.host.as_str(), self.port)).await {
                Ok(stream) => {
                    self.reader = Some(BufReader::new(stream));
                    self.registry.record_reconnect(&self.mac);
                    info!(mac = %self.mac, host = %self.host, port = self.port, "tcp connected");
                    return Ok(());
                }
                Err(err) => {
                    self.registry.record_retry_failure(&self.mac, "io_error");
                    warn!(
                        mac = %self.mac,
                        attempt,
                        error = %err,
                        "tcp connect failed"
                    );
                    if self.policy.wait(attempt).await.is_err() {
                        break;
                    }
                }
            }
        }
        bail!(
            "tcp connect to {}:{} exceeded max retry attempts",
            self.host,
            self.port
        )
    }

    /// Reads the next envelope. `Ok(None)` means the peer closed the stream;
    /// malformed lines are dead-lettered and skipped.
    pub async fn next(&mut self) -> Result<Option<Envelope>> {
        loop {
            let reader = self
                .reader
                .as_mut()
                .context("tcp ingress is not connected")?;
            let mut line = String::new();
            let read = reader
                .read_line(&mut line)
                .await
                .context("tcp read failed")?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(_) => {
                    self.dead_letter_line(trimmed).await;
                    continue;
                }
            };
            let Value::Object(payload) = value else {
                self.dead_letter_line(trimmed).await;
                continue;
            };

            let mac = payload
                .get("mac")
                .and_then(Value::as_str)
                .and_then(normalize_mac)
                .unwrap_or_else(|| self.mac.clone());
            self.registry.record_ingress(&self.mac);
            return Ok(Some(Envelope { mac, payload }));
        }
    }

    /// Best-effort close; also resets the lag gauge for this MAC.
    pub async fn disconnect(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            let _ = reader.get_mut().shutdown().await;
        }
        self.registry.record_lag(&self.mac, 0.0).await;
    }

    async fn dead_letter_line(&self, line: &str) {
        self.registry.record_dead_letter("invalid_json");
        let raw = serde_json::json!({ "raw": line });
        let _ = self
            .store
            .append_dead_letter(None, Some(&self.mac), &raw, "invalid_json", false, None)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn ingress_for(port: u16) -> TcpIngress {
        let store = Store::in_memory().await.unwrap();
        TcpIngress::new(
            "127.0.0.1".into(),
            port,
            "AA0000000001".into(),
            RetryPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                max_attempts: 2,
            },
            Arc::new(SubscriberRegistry::new()),
            store,
        )
    }

    #[tokio::test]
    async fn reads_json_lines_and_skips_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"{\"mac\":\"AA0000000001\",\"energy\":\"1.5\"}\nnot json\n{\"energy\":\"2.0\"}\n")
                .await
                .unwrap();
            // Closing the socket ends the stream.
        });

        let mut ingress = ingress_for(port).await;
        ingress.connect().await.unwrap();

        let first = ingress.next().await.unwrap().expect("first envelope");
        assert_eq!(first.mac, "AA0000000001");
        assert_eq!(first.payload["energy"], "1.5");

        // The garbage line is skipped; the mac-less line falls back to the
        // configured MAC.
        let second = ingress.next().await.unwrap().expect("second envelope");
        assert_eq!(second.mac, "AA0000000001");
        assert_eq!(second.payload["energy"], "2.0");

        assert!(ingress.next().await.unwrap().is_none());
        server.await.unwrap();
        ingress.disconnect().await;
    }

    #[tokio::test]
    async fn connect_gives_up_after_max_attempts() {
        // Bind then drop a listener so the port is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut ingress = ingress_for(port).await;
        assert!(ingress.connect().await.is_err());
    }

    #[tokio::test]
    async fn malformed_line_is_dead_lettered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"broken\n").await.unwrap();
        });

        let mut ingress = ingress_for(port).await;
        ingress.connect().await.unwrap();
        let store = ingress.store.clone();

        assert!(ingress.next().await.unwrap().is_none());
        assert_eq!(store.dead_letter_count().await.unwrap(), 1);
        server.await.unwrap();
    }
}
