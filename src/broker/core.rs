use crate::bus::subjects::{is_durable, subject_matches};
use crate::bus::{Message, MessageHandler};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Redelivery ceiling for nacked durable messages; after this the message
/// stays on the stream for the next replay.
const MAX_REDELIVERY: u32 = 5;

struct Subscription {
    id: u64,
    queue_group: Option<String>,
    handler: Arc<dyn MessageHandler>,
}

struct Delivery {
    message: Message,
    ack: Option<oneshot::Sender<Result<()>>>,
    /// Stream key for durable messages; acknowledged entries are removed.
    store_key: Option<u64>,
}

/// In-process message broker core: subject routing, queue groups and
/// sled-backed durable streams.
///
/// The subscription map is read on every dispatch and mutated only on
/// subscribe/unsubscribe, hence the read/write lock.
pub struct BrokerCore {
    tx: mpsc::UnboundedSender<Delivery>,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    next_sub_id: AtomicU64,
    store: Option<sled::Db>,
    cancel: CancellationToken,
    ready_rx: watch::Receiver<bool>,
    loop_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BrokerCore {
    /// Boot the core and its dispatch loop. Pending durable messages from a
    /// previous run are replayed before the core reports ready.
    #[must_use]
    pub fn launch(store: Option<sled::Db>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);

        let core = Arc::new(Self {
            tx,
            subscriptions: RwLock::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            store,
            cancel: CancellationToken::new(),
            ready_rx,
            loop_handle: std::sync::Mutex::new(None),
        });

        let dispatch_core = core.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = dispatch_core.replay_pending() {
                warn!(%err, "failed to replay pending durable messages");
            }
            let _ = ready_tx.send(true);
            dispatch_core.dispatch_loop(rx).await;
        });
        *core.loop_handle.lock().expect("loop handle lock") = Some(handle);

        core
    }

    /// Hand the dispatch-loop handle to whoever supervises shutdown.
    #[must_use]
    pub fn take_loop_handle(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.loop_handle.lock().expect("loop handle lock").take()
    }

    /// Watch channel flipping to true once the dispatch loop is live.
    #[must_use]
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Stop the dispatch loop and flush the stream store.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(store) = &self.store {
            if let Err(err) = store.flush() {
                warn!(%err, "failed to flush broker store on shutdown");
            }
        }
    }

    /// Local enqueue; durable subjects are persisted first. Failing to
    /// enqueue is the only publish-side Messaging error.
    pub fn enqueue(
        &self,
        message: Message,
        ack: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let store_key = if is_durable(&message.subject) {
            self.persist(&message)?
        } else {
            None
        };
        self.tx
            .send(Delivery {
                message,
                ack,
                store_key,
            })
            .map_err(|_| Error::Messaging("broker dispatch loop is not running".to_string()))
    }

    pub async fn subscribe(
        &self,
        pattern: &str,
        queue_group: Option<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<u64> {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions
                .entry(pattern.to_string())
                .or_default()
                .push(Subscription {
                    id,
                    queue_group,
                    handler,
                });
        }
        // A new subscriber on a durable family picks up retained messages.
        self.replay_matching(pattern);
        debug!(pattern, id, "subscription registered");
        Ok(id)
    }

    /// Re-enqueue retained durable messages whose subject matches a newly
    /// registered pattern. At-least-once delivery allows the duplicate
    /// window this opens.
    fn replay_matching(&self, pattern: &str) {
        let Some(store) = &self.store else {
            return;
        };
        for name in store.tree_names() {
            let Ok(name_str) = std::str::from_utf8(&name) else {
                continue;
            };
            let Some(subject) = name_str.strip_prefix(STREAM_TREE_PREFIX) else {
                continue;
            };
            if !subject_matches(pattern, subject) {
                continue;
            }
            let Ok(tree) = store.open_tree(&name) else {
                continue;
            };
            for (key, value) in tree.iter().flatten() {
                let Ok(message) = serde_json::from_slice::<Message>(&value) else {
                    continue;
                };
                let mut key_bytes = [0_u8; 8];
                key_bytes.copy_from_slice(&key);
                let _ = self.tx.send(Delivery {
                    message,
                    ack: None,
                    store_key: Some(u64::from_be_bytes(key_bytes)),
                });
            }
        }
    }

    pub async fn unsubscribe(&self, id: u64) {
        let mut subscriptions = self.subscriptions.write().await;
        for subs in subscriptions.values_mut() {
            subs.retain(|s| s.id != id);
        }
        subscriptions.retain(|_, subs| !subs.is_empty());
    }

    /// Unacknowledged durable messages for a subject.
    pub fn pending_len(&self, subject: &str) -> Result<usize> {
        match &self.store {
            Some(store) => Ok(store.open_tree(stream_tree_name(subject))?.len()),
            None => Ok(0),
        }
    }

    fn persist(&self, message: &Message) -> Result<Option<u64>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let tree = store.open_tree(stream_tree_name(&message.subject))?;
        let key = store.generate_id()?;
        tree.insert(key.to_be_bytes(), serde_json::to_vec(message)?)?;
        Ok(Some(key))
    }

    fn acknowledge(&self, subject: &str, key: u64) {
        if let Some(store) = &self.store {
            let result = store
                .open_tree(stream_tree_name(subject))
                .and_then(|tree| tree.remove(key.to_be_bytes()));
            if let Err(err) = result {
                warn!(%err, subject, "failed to acknowledge durable message");
            }
        }
    }

    /// Re-enqueue persisted messages left over from a previous run.
    fn replay_pending(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut replayed = 0_usize;
        for name in store.tree_names() {
            let Ok(name_str) = std::str::from_utf8(&name) else {
                continue;
            };
            if !name_str.starts_with(STREAM_TREE_PREFIX) {
                continue;
            }
            let tree = store.open_tree(&name)?;
            for entry in tree.iter() {
                let (key, value) = entry?;
                let Ok(message) = serde_json::from_slice::<Message>(&value) else {
                    warn!(tree = name_str, "dropping undecodable stream entry");
                    tree.remove(&key)?;
                    continue;
                };
                let mut key_bytes = [0_u8; 8];
                key_bytes.copy_from_slice(&key);
                let _ = self.tx.send(Delivery {
                    message,
                    ack: None,
                    store_key: Some(u64::from_be_bytes(key_bytes)),
                });
                replayed += 1;
            }
        }
        if replayed > 0 {
            debug!(replayed, "replayed pending durable messages");
        }
        Ok(())
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        let mut queue_cursors: HashMap<(String, String), usize> = HashMap::new();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => self.deliver(delivery, &mut queue_cursors).await,
                    None => break,
                }
            }
        }
        debug!("broker dispatch loop stopped");
    }

    async fn deliver(
        &self,
        delivery: Delivery,
        queue_cursors: &mut HashMap<(String, String), usize>,
    ) {
        let Delivery {
            message,
            ack,
            store_key,
        } = delivery;

        let handlers = self.select_handlers(&message.subject, queue_cursors).await;
        if handlers.is_empty() {
            debug!(subject = %message.subject, "no subscribers; durable messages stay pending");
            if let Some(ack) = ack {
                let _ = ack.send(Ok(()));
            }
            return;
        }

        let mut failed = false;
        for handler in handlers {
            if let Err(err) = handler.handle(&message).await {
                failed = true;
                warn!(
                    subject = %message.subject,
                    attempt = message.attempt,
                    %err,
                    "handler returned an error"
                );
            }
        }

        if failed && store_key.is_some() {
            // Negative acknowledgment: schedule a redelivery or retain.
            if message.attempt < MAX_REDELIVERY {
                let tx = self.tx.clone();
                let mut retry = message.clone();
                retry.attempt += 1;
                let delay = std::time::Duration::from_millis(100 * u64::from(retry.attempt));
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Delivery {
                        message: retry,
                        ack: None,
                        store_key,
                    });
                });
            } else {
                error!(
                    subject = %message.subject,
                    id = %message.id,
                    "durable message exhausted redeliveries; retained on stream"
                );
            }
        } else if let Some(key) = store_key {
            self.acknowledge(&message.subject, key);
        }

        if let Some(ack) = ack {
            let outcome = if failed {
                Err(Error::Messaging(format!(
                    "delivery of {} failed on subject {}",
                    message.id, message.subject
                )))
            } else {
                Ok(())
            };
            let _ = ack.send(outcome);
        }
    }

    async fn select_handlers(
        &self,
        subject: &str,
        queue_cursors: &mut HashMap<(String, String), usize>,
    ) -> Vec<Arc<dyn MessageHandler>> {
        let subscriptions = self.subscriptions.read().await;
        let mut selected = Vec::new();

        for (pattern, subs) in subscriptions.iter() {
            if !subject_matches(pattern, subject) {
                continue;
            }

            // Plain subscriptions all fire, in registration order.
            for sub in subs.iter().filter(|s| s.queue_group.is_none()) {
                selected.push(sub.handler.clone());
            }

            // Queue groups get exactly one delivery each, round-robin.
            let mut groups: Vec<&str> = subs
                .iter()
                .filter_map(|s| s.queue_group.as_deref())
                .collect();
            groups.sort_unstable();
            groups.dedup();
            for group in groups {
                let members: Vec<&Subscription> = subs
                    .iter()
                    .filter(|s| s.queue_group.as_deref() == Some(group))
                    .collect();
                let cursor = queue_cursors
                    .entry((pattern.clone(), group.to_string()))
                    .or_insert(0);
                let member = members[*cursor % members.len()];
                *cursor = cursor.wrapping_add(1);
                selected.push(member.handler.clone());
            }
        }

        selected
    }
}

const STREAM_TREE_PREFIX: &str = "stream_";

fn stream_tree_name(subject: &str) -> String {
    format!("{STREAM_TREE_PREFIX}{subject}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FnHandler;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn message(subject: &str) -> Message {
        Message::new(subject, &serde_json::json!({"k": "v"})).unwrap()
    }

    #[tokio::test]
    async fn durable_nack_is_redelivered_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::Config::new().path(dir.path()).open().unwrap();
        let core = BrokerCore::launch(Some(db));

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        core.subscribe(
            "papers.indexed",
            None,
            Arc::new(FnHandler(move |_msg: Message| {
                let attempts = attempts_clone.clone();
                async move {
                    // Fail the first two deliveries, then acknowledge.
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Messaging("not yet".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })),
        )
        .await
        .unwrap();

        core.enqueue(message("papers.indexed"), None).unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(core.pending_len("papers.indexed").unwrap(), 0);
    }

    #[tokio::test]
    async fn unsubscribed_durable_messages_stay_pending() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::Config::new().path(dir.path()).open().unwrap();
        let core = BrokerCore::launch(Some(db));

        core.enqueue(message("papers.processing"), None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(core.pending_len("papers.processing").unwrap(), 1);
    }

    #[tokio::test]
    async fn non_durable_subjects_are_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::Config::new().path(dir.path()).open().unwrap();
        let core = BrokerCore::launch(Some(db));

        core.enqueue(message("search.completed"), None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(core.pending_len("search.completed").unwrap(), 0);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_a_messaging_error() {
        let core = BrokerCore::launch(None);
        core.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The loop has exited; the channel may still accept sends until the
        // receiver drops, so poll until the error surfaces.
        let mut saw_error = false;
        for _ in 0..20 {
            if core.enqueue(message("search.completed"), None).is_err() {
                saw_error = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_error);
    }
}
