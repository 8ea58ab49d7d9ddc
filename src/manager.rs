//! Supervision of per-device ingestion workers.
//!
//! One tokio task per MAC, reconciled against the device table: admin
//! mutations call [`SubscriptionManager::apply_device`], which starts, restarts
//! or stops the worker to match the row. Workers are cancelled cooperatively
//! via a `CancellationToken` and must never hold the manager's locks while
//! awaiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ingest;
use crate::ingress::{Ingress, IngressDeps};
use crate::model::Device;

/// Pause between sessions after a stream ended cleanly.
const SESSION_RESTART_DELAY: Duration = Duration::from_secs(1);

struct WorkerEntry {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

type TaskTable = Arc<Mutex<HashMap<String, WorkerEntry>>>;

pub struct SubscriptionManager {
    deps: IngressDeps,
    tasks: TaskTable,
    /// Serializes start/stop so two admin calls cannot race a MAC into two
    /// workers. Workers themselves only touch the task table.
    ops: Mutex<()>,
    generation: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(deps: IngressDeps) -> Self {
        Self {
            deps,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            ops: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Spawns a worker for every device with collection enabled.
    pub async fn startup(&self) -> Result<()> {
        let devices = self.deps.store.enabled_collecting_devices().await?;
        info!(count = devices.len(), "starting collection workers");
        for device in devices {
            self.start_for_device(&device).await;
        }
        Ok(())
    }

    /// Reconciles one device: start/restart the worker when it should
    /// collect, stop it otherwise.
    pub async fn apply_device(&self, device: &Device) {
        if device.should_collect() {
            self.start_for_device(device).await;
        } else {
            self.stop_for_device(&device.mac).await;
        }
    }

    /// Atomically replaces any existing worker for this MAC with a fresh one.
    pub async fn start_for_device(&self, device: &Device) {
        let _guard = self.ops.lock().await;
        self.stop_entry(&device.mac).await;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        info!(mac = %device.mac, ingress = ?device.ingress_type, "starting collection worker");

        let mut tasks = self.tasks.lock().await;
        let handle = tokio::spawn(run_worker(
            self.deps.clone(),
            Arc::clone(&self.tasks),
            device.mac.clone(),
            generation,
            token.clone(),
        ));
        tasks.insert(
            device.mac.clone(),
            WorkerEntry {
                generation,
                token,
                handle,
            },
        );
    }

    /// Cancels the worker and waits for it to finish.
    pub async fn stop_for_device(&self, mac: &str) {
        let _guard = self.ops.lock().await;
        self.stop_entry(mac).await;
    }

    /// Cancels every worker and waits for all of them.
    pub async fn shutdown(&self) {
        let _guard = self.ops.lock().await;
        let entries: Vec<WorkerEntry> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.token.cancel();
        }
        join_all(entries.into_iter().map(|entry| entry.handle)).await;
        info!("all collection workers stopped");
    }

    /// MACs with a live worker task, for `/health` and tests.
    pub async fn active_macs(&self) -> Vec<String> {
        self.tasks.lock().await.keys().cloned().collect()
    }

    async fn stop_entry(&self, mac: &str) {
        let entry = self.tasks.lock().await.remove(mac);
        if let Some(entry) = entry {
            info!(mac, "stopping collection worker");
            entry.token.cancel();
            // Join errors only mean the task panicked; the worker is gone
            // either way.
            let _ = entry.handle.await;
        }
    }
}

enum SessionEnd {
    Cancelled,
    StreamEnded,
    Failed,
}

/// Supervised per-device loop: refresh the row, build an adapter, consume
/// envelopes, back off on failure. Exits when the device stops being
/// eligible, the retry budget is spent, or the token is cancelled.
async fn run_worker(
    deps: IngressDeps,
    tasks: TaskTable,
    mac: String,
    generation: u64,
    token: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut create_attempt: u32 = 0;

    loop {
        if token.is_cancelled() {
            break;
        }

        let device = match deps.store.device_by_mac(&mac).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!(mac = %mac, "device row disappeared, stopping worker");
                break;
            }
            Err(err) => {
                error!(mac = %mac, error = %err, "device refresh failed");
                attempt += 1;
                if !backoff(&deps, &token, attempt).await {
                    break;
                }
                continue;
            }
        };
        if !device.should_collect() {
            info!(mac = %mac, "device no longer collecting, stopping worker");
            break;
        }

        let mut adapter = match Ingress::create(&device, &deps) {
            Ok(adapter) => {
                create_attempt = 0;
                adapter
            }
            Err(err) => {
                create_attempt += 1;
                error!(mac = %mac, attempt = create_attempt, error = %err, "adapter construction failed");
                if !backoff(&deps, &token, create_attempt).await {
                    break;
                }
                continue;
            }
        };

        let progressed = AtomicBool::new(false);
        let outcome = run_session(&deps, &device, &mut adapter, &token, &progressed).await;

        adapter.disconnect().await;
        deps.registry.deactivate(&device.mac).await;

        if progressed.load(Ordering::Relaxed) {
            attempt = 0;
        }
        match outcome {
            SessionEnd::Cancelled => break,
            SessionEnd::StreamEnded => {
                attempt = 0;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(SESSION_RESTART_DELAY) => {}
                }
            }
            SessionEnd::Failed => {
                attempt += 1;
                if !backoff(&deps, &token, attempt).await {
                    break;
                }
            }
        }
    }

    remove_self(&tasks, &mac, generation).await;
}

/// Connect and consume until cancellation, stream end or an error.
async fn run_session(
    deps: &IngressDeps,
    device: &Device,
    adapter: &mut Ingress,
    token: &CancellationToken,
    progressed: &AtomicBool,
) -> SessionEnd {
    let session = async {
        adapter.connect().await?;
        deps.registry.activate(device).await;
        loop {
            match adapter.next().await? {
                Some(envelope) => {
                    ingest::handle_envelope(&deps.store, &deps.registry, device, envelope).await;
                    progressed.store(true, Ordering::Relaxed);
                }
                None => return Ok::<bool, anyhow::Error>(false),
            }
        }
    };

    tokio::select! {
        _ = token.cancelled() => SessionEnd::Cancelled,
        result = session => match result {
            Ok(_) => SessionEnd::StreamEnded,
            Err(err) => {
                error!(mac = %device.mac, error = %err, "collection session failed");
                SessionEnd::Failed
            }
        }
    }
}

/// Sleeps per the retry policy; returns false once the budget is spent or
/// the worker is cancelled.
async fn backoff(deps: &IngressDeps, token: &CancellationToken, attempt: u32) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        waited = deps.policy.wait(attempt) => {
            if waited.is_err() {
                error!("retry budget exhausted, worker terminating");
            }
            waited.is_ok()
        }
    }
}

/// Drops this worker's own table entry, unless a newer worker already took
/// the MAC over.
async fn remove_self(tasks: &Mutex<HashMap<String, WorkerEntry>>, mac: &str, generation: u64) {
    let mut tasks = tasks.lock().await;
    if tasks
        .get(mac)
        .is_some_and(|entry| entry.generation == generation)
    {
        tasks.remove(mac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceStatus, IngressType};
    use crate::mqtt::MqttPool;
    use crate::registry::SubscriberRegistry;
    use crate::retry::RetryPolicy;
    use crate::store::{DeviceDraft, Store};
    use serde_json::{json, Value};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if condition().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn manager_with_store() -> (Arc<SubscriptionManager>, Store, Arc<SubscriberRegistry>) {
        let store = Store::in_memory().await.unwrap();
        let registry = Arc::new(SubscriberRegistry::new());
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(50),
            max_attempts: 3,
        };
        let deps = IngressDeps {
            pool: Arc::new(MqttPool::new(
                Arc::clone(&registry),
                store.clone(),
                policy,
            )),
            registry: Arc::clone(&registry),
            store: store.clone(),
            policy,
        };
        (Arc::new(SubscriptionManager::new(deps)), store, registry)
    }

    async fn create_tcp_device(store: &Store, mac: &str, port: u16) -> crate::model::Device {
        let Value::Object(config) = json!({
            "name": mac,
            "broker": "127.0.0.1",
            "port": port,
        }) else {
            unreachable!()
        };
        store
            .create_device(&DeviceDraft {
                mac: mac.into(),
                status: DeviceStatus::Enabled,
                collect_enabled: true,
                ingress_type: IngressType::Tcp,
                ingress_config: config,
                description: None,
                user_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn worker_ingests_readings_end_to_end_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (manager, store, _registry) = manager_with_store().await;
        let device = create_tcp_device(&store, "AA0000000001", port).await;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(
                    b"{\"mac\":\"AA0000000001\",\"ts\":\"2025-01-01T11:55:00Z\",\"energy\":\"11.2\",\"power\":\"1.7\"}\n",
                )
                .await
                .unwrap();
            // Keep the stream open long enough for the worker to consume.
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        manager.start_for_device(&device).await;
        let store_probe = store.clone();
        wait_until(|| {
            let store = store_probe.clone();
            async move { store.reading_count("AA0000000001").await.unwrap() == 1 }
        })
        .await;

        manager.shutdown().await;
        server.abort();
    }

    #[tokio::test]
    async fn admin_toggle_stops_the_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (manager, store, registry) = manager_with_store().await;
        let device = create_tcp_device(&store, "AA0000000002", port).await;

        let server = tokio::spawn(async move {
            let (mut _socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        manager.start_for_device(&device).await;
        let registry_probe = Arc::clone(&registry);
        wait_until(|| {
            let registry = Arc::clone(&registry_probe);
            async move { registry.snapshot().await.contains_key("AA0000000002") }
        })
        .await;

        let updated = store
            .update_device(
                "AA0000000002",
                &crate::store::DevicePatch {
                    collect_enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        manager.apply_device(&updated).await;

        assert!(manager.active_macs().await.is_empty());
        assert!(!registry.snapshot().await.contains_key("AA0000000002"));
        server.abort();
    }

    #[tokio::test]
    async fn at_most_one_worker_per_mac() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (manager, store, _registry) = manager_with_store().await;
        let device = create_tcp_device(&store, "AA0000000003", port).await;

        manager.start_for_device(&device).await;
        manager.start_for_device(&device).await;

        let macs = manager.active_macs().await;
        assert_eq!(macs, vec!["AA0000000003".to_string()]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn ineligible_device_worker_exits_and_clears_its_entry() {
        let (manager, store, _registry) = manager_with_store().await;
        let device = create_tcp_device(&store, "AA0000000004", 1).await;
        store
            .update_device(
                "AA0000000004",
                &crate::store::DevicePatch {
                    collect_enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Start directly (bypassing apply_device): the worker refreshes the
        // row, sees it is ineligible and removes itself from the table.
        manager.start_for_device(&device).await;
        let manager_probe = Arc::clone(&manager);
        wait_until(|| {
            let manager = Arc::clone(&manager_probe);
            async move { manager.active_macs().await.is_empty() }
        })
        .await;
    }

    #[tokio::test]
    async fn worker_gives_up_after_retry_budget_and_leaves_table() {
        let (manager, store, _registry) = manager_with_store().await;
        // Nothing listens on this port, so every connect attempt fails.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let device = create_tcp_device(&store, "AA0000000005", port).await;

        manager.start_for_device(&device).await;
        let manager_probe = Arc::clone(&manager);
        wait_until(|| {
            let manager = Arc::clone(&manager_probe);
            async move { manager.active_macs().await.is_empty() }
        })
        .await;
    }
}
