use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

use crate::models::MonitorHistory;

const CHANNEL_CAPACITY: usize = 16;

pub type HistoryFeed = Vec<MonitorHistory>;

/// Cheap fingerprint used to decide whether a payload is worth broadcasting.
pub trait Signature {
    fn signature(&self) -> String;
}

impl Signature for HistoryFeed {
    fn signature(&self) -> String {
        self.iter()
            .map(|h| {
                let stamp = |t: Option<chrono::DateTime<chrono::Utc>>| {
                    t.map_or_else(|| "-".to_string(), |t| t.timestamp_millis().to_string())
                };
                format!("{}:{}:{}:{}", h.monitor_id, stamp(h.newest_record), stamp(h.oldest_record), h.total_records)
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}

struct Published<T> {
    latest: Option<Arc<T>>,
    signature: Option<String>,
}

pub struct ViewSync<T> {
    sender: broadcast::Sender<Arc<T>>,
    published: Mutex<Published<T>>,
}

impl<T: Signature + Send + Sync + 'static> Default for ViewSync<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Signature + Send + Sync + 'static> ViewSync<T> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            published: Mutex::new(Published { latest: None, signature: None }),
        }
    }

    /// Returns whether the payload was broadcast.
    pub fn publish(&self, payload: impl Into<Arc<T>>) -> bool {
        let payload: Arc<T> = payload.into();
        let signature = payload.signature();

        let mut published = self.published.lock().unwrap_or_else(|e| e.into_inner());
        published.latest = Some(Arc::clone(&payload));
        if published.signature.as_deref() == Some(signature.as_str()) {
            return false;
        }
        published.signature = Some(signature);
        drop(published);

        // No receivers is fine: nobody is watching right now.
        let receivers = self.sender.send(payload).unwrap_or(0);
        debug!("Broadcast history feed to {} views", receivers);
        true
    }

    pub fn latest(&self) -> Option<Arc<T>> {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).latest.clone()
    }

    /// A new view starts from the latest published payload.
    pub fn subscribe(&self) -> View<T> {
        View {
            receiver: self.sender.subscribe(),
            cache: self.latest(),
        }
    }
}

pub struct View<T> {
    receiver: broadcast::Receiver<Arc<T>>,
    cache: Option<Arc<T>>,
}

impl<T: Send + Sync> View<T> {
    /// Local read-cache, overwritten by any broadcasts received since the
    /// last call.
    pub fn latest(&mut self) -> Option<Arc<T>> {
        loop {
            match self.receiver.try_recv() {
                Ok(payload) => self.cache = Some(payload),
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!("View lagged behind by {} broadcasts", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        self.cache.clone()
    }

    /// Waits for the next broadcast. `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<Arc<T>> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => {
                    self.cache = Some(Arc::clone(&payload));
                    return Some(payload);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("View lagged behind by {} broadcasts", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
