use super::{parse_size, BrokerCore};
use crate::bus::BusClient;
use crate::config::BrokerSettings;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long `start` waits for the core to become ready.
const READY_TIMEOUT: Duration = Duration::from_secs(10);
/// Graceful shutdown deadline before the dispatch loop is aborted.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// Health probe cadence.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

enum BrokerState {
    Stopped,
    Running {
        core: Arc<BrokerCore>,
        probe: JoinHandle<()>,
    },
}

/// Supervised lifecycle around the in-process broker core.
///
/// `start` validates configuration, creates the stream store, boots the
/// core and waits for readiness; a periodic probe keeps the healthy flag
/// current. `stop` is graceful with a hard deadline, and idempotent.
pub struct EmbeddedBroker {
    settings: BrokerSettings,
    state: Mutex<BrokerState>,
    healthy: Arc<AtomicBool>,
}

impl EmbeddedBroker {
    #[must_use]
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(BrokerState::Stopped),
            healthy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Client URL the bus connects to.
    #[must_use]
    pub fn client_url(&self) -> String {
        let scheme = if self.settings.tls.is_some() {
            "brokers"
        } else {
            "broker"
        };
        format!("{scheme}://{}:{}", self.settings.host, self.settings.port)
    }

    /// Validate config, boot the core and wait up to 10s for readiness.
    /// Failure leaves no running task behind.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(&*state, BrokerState::Running { .. }) {
            return Ok(());
        }

        self.validate()?;

        let store = match &self.settings.store_dir {
            Some(dir) => {
                create_store_dir(dir)?;
                let db = sled::Config::new().path(dir.join("streams")).open()?;
                Some(db)
            }
            None => None,
        };

        let core = BrokerCore::launch(store);

        let mut ready = core.ready();
        let became_ready = tokio::time::timeout(READY_TIMEOUT, async {
            while !*ready.borrow() {
                if ready.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await;

        match became_ready {
            Ok(true) => {}
            _ => {
                core.shutdown();
                if let Some(handle) = core.take_loop_handle() {
                    handle.abort();
                }
                return Err(Error::Messaging(format!(
                    "broker at {} did not become ready within {READY_TIMEOUT:?}",
                    self.client_url()
                )));
            }
        }

        let probe = self.spawn_probe(core.clone());
        self.healthy.store(true, Ordering::Relaxed);
        info!(url = %self.client_url(), "embedded broker started");

        *state = BrokerState::Running { core, probe };
        Ok(())
    }

    /// Graceful stop with a 30s deadline, then forced. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let BrokerState::Running { core, probe } =
            std::mem::replace(&mut *state, BrokerState::Stopped)
        else {
            return Ok(());
        };

        probe.abort();
        core.shutdown();
        if let Some(handle) = core.take_loop_handle() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("broker dispatch loop missed the stop deadline; aborting");
                    // The handle was consumed by the timeout future; the
                    // cancel token has already fired, so the task unwinds
                    // on its next poll.
                }
            }
        }

        self.healthy.store(false, Ordering::Relaxed);
        info!("embedded broker stopped");
        Ok(())
    }

    /// Bus client bound to the running core.
    pub async fn client(&self, request_timeout: Duration) -> Result<BusClient> {
        let state = self.state.lock().await;
        match &*state {
            BrokerState::Running { core, .. } => Ok(BusClient::new(core.clone(), request_timeout)),
            BrokerState::Stopped => Err(Error::Messaging(
                "embedded broker is not running".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub async fn is_running(&self) -> bool {
        matches!(&*self.state.lock().await, BrokerState::Running { .. })
    }

    fn validate(&self) -> Result<()> {
        if self.settings.host.trim().is_empty() {
            return Err(Error::Validation {
                field: "broker.host".to_string(),
                reason: "host cannot be empty".to_string(),
            });
        }
        if self.settings.port == 0 {
            return Err(Error::Validation {
                field: "broker.port".to_string(),
                reason: "port must be non-zero".to_string(),
            });
        }
        if let Some(max_memory) = &self.settings.max_memory {
            parse_size(max_memory)?;
        }
        if let Some(max_storage) = &self.settings.max_storage {
            parse_size(max_storage)?;
        }
        if let Some(cluster) = &self.settings.cluster {
            if cluster.name.trim().is_empty() {
                return Err(Error::Validation {
                    field: "broker.cluster.name".to_string(),
                    reason: "cluster name cannot be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    fn spawn_probe(&self, core: Arc<BrokerCore>) -> JoinHandle<()> {
        let healthy = self.healthy.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROBE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let ready = *core.ready().borrow();
                healthy.store(ready, Ordering::Relaxed);
            }
        })
    }
}

fn create_store_dir(dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(store_dir: Option<std::path::PathBuf>) -> BrokerSettings {
        BrokerSettings {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 4222,
            store_dir,
            max_memory: None,
            max_storage: None,
            tls: None,
            cluster: None,
        }
    }

    #[tokio::test]
    async fn start_then_stop_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let broker = EmbeddedBroker::new(settings(Some(dir.path().to_path_buf())));

        broker.start().await.unwrap();
        assert!(broker.is_running().await);
        assert!(broker.is_healthy());

        broker.stop().await.unwrap();
        assert!(!broker.is_running().await);
        // Second stop must not error.
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_creates_the_store_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("streams-root");
        let broker = EmbeddedBroker::new(settings(Some(store.clone())));
        broker.start().await.unwrap();
        assert!(store.is_dir());
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_size_cap_fails_start() {
        let mut s = settings(None);
        s.max_memory = Some("12XB".to_string());
        let broker = EmbeddedBroker::new(s);
        let err = broker.start().await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!broker.is_running().await);
    }

    #[tokio::test]
    async fn client_requires_a_running_broker() {
        let broker = EmbeddedBroker::new(settings(None));
        assert!(broker.client(Duration::from_secs(1)).await.is_err());

        broker.start().await.unwrap();
        let client = broker.client(Duration::from_secs(1)).await.unwrap();
        client
            .publish("search.completed", &serde_json::json!({}))
            .await
            .unwrap();
        broker.stop().await.unwrap();
    }

    #[test]
    fn client_url_reflects_tls() {
        let broker = EmbeddedBroker::new(settings(None));
        assert_eq!(broker.client_url(), "broker://127.0.0.1:4222");
    }

    #[tokio::test]
    async fn durable_messages_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().to_path_buf();

        {
            let broker = EmbeddedBroker::new(settings(Some(store.clone())));
            broker.start().await.unwrap();
            let client = broker.client(Duration::from_secs(1)).await.unwrap();
            // No subscriber: the durable message stays pending.
            client
                .publish("papers.indexed", &serde_json::json!({"paper_id": "arxiv_1"}))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(client.pending("papers.indexed").unwrap(), 1);
            broker.stop().await.unwrap();
        }

        let broker = EmbeddedBroker::new(settings(Some(store)));
        broker.start().await.unwrap();
        let client = broker.client(Duration::from_secs(1)).await.unwrap();

        let received = Arc::new(AtomicBool::new(false));
        let received_clone = received.clone();
        client
            .subscribe(
                "papers.indexed",
                Arc::new(crate::bus::FnHandler(move |_msg: crate::bus::Message| {
                    let received = received_clone.clone();
                    async move {
                        received.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                })),
            )
            .await
            .unwrap();

        // Replay happens at startup; the pending message reaches the new
        // subscriber without being republished.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(received.load(Ordering::SeqCst));
        broker.stop().await.unwrap();
    }
}
