/**
 * nat_traversal/signalling.rs
 *
 * Signalling channel contract and an in-process implementation
 */

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;

use super::error::{Result, TraversalError};

/// Keyed out-of-band channel used to exchange peer addresses and start
/// time proposals. Implementations own their transport and credentials;
/// the traversal core keeps no channel state of its own.
#[async_trait]
pub trait SignallingChannel: Send + Sync {
    /// Publish `payload` tagged with `id`
    async fn publish(&self, id: &str, payload: &str) -> Result<()>;

    /// Latest payload published for `id`, if one is still available
    async fn retrieve(&self, id: &str) -> Result<String>;

    /// Block until a payload is published for `id` after this call has
    /// started. A `timeout_secs` of 0 waits indefinitely.
    async fn listen(&self, id: &str, timeout_secs: u64) -> Result<String>;
}

/// In-process channel backed by a shared topic map.
///
/// Wires both roles together inside one process, which is what tests
/// and single-machine setups need; relay-backed transports implement
/// the same trait outside this crate. Clones share the topic map.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

struct Topic {
    latest: Option<String>,
    live: broadcast::Sender<String>,
}

impl Topic {
    fn new() -> Self {
        let (live, _) = broadcast::channel(16);
        Self { latest: None, live }
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    async fn subscribe(&self, id: &str) -> broadcast::Receiver<String> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(id.to_string())
            .or_insert_with(Topic::new)
            .live
            .subscribe()
    }

    async fn next_payload(mut receiver: broadcast::Receiver<String>) -> Result<String> {
        loop {
            match receiver.recv().await {
                Ok(payload) => return Ok(payload),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(TraversalError::SignallingUnavailable(
                        "Channel closed".into(),
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl SignallingChannel for MemoryChannel {
    async fn publish(&self, id: &str, payload: &str) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(id.to_string()).or_insert_with(Topic::new);
        topic.latest = Some(payload.to_string());
        // nobody listening is fine; the latest copy still serves retrieve
        let _ = topic.live.send(payload.to_string());
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> Result<String> {
        let topics = self.topics.lock().await;
        topics
            .get(id)
            .and_then(|topic| topic.latest.clone())
            .ok_or_else(|| {
                TraversalError::SignallingUnavailable(format!("Nothing published for {}", id))
            })
    }

    async fn listen(&self, id: &str, timeout_secs: u64) -> Result<String> {
        let receiver = self.subscribe(id).await;
        if timeout_secs == 0 {
            return Self::next_payload(receiver).await;
        }
        timeout(
            Duration::from_secs(timeout_secs),
            Self::next_payload(receiver),
        )
        .await
        .map_err(|_| {
            TraversalError::Timeout(format!("No payload for {} within {}s", id, timeout_secs))
        })?
    }
}
