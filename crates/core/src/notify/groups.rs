//! In-process session group registry.
//!
//! Each session gets a bounded outbound queue. A session that cannot keep up
//! loses frames rather than slowing down the sender.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use super::{GroupSender, NotifyError};

pub type SessionId = u64;

/// Frame pushed to a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubMessage {
    pub event: String,
    pub data: serde_json::Value,
}

/// A session's membership in one group.
#[derive(Debug)]
pub struct SessionSubscription {
    pub id: SessionId,
    pub group: String,
    pub receiver: mpsc::Receiver<HubMessage>,
}

type Members = HashMap<SessionId, mpsc::Sender<HubMessage>>;

#[derive(Clone)]
pub struct SessionGroups {
    groups: Arc<RwLock<HashMap<String, Members>>>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl SessionGroups {
    pub fn new(buffer: usize) -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        }
    }

    /// Add a new session to `group`.
    pub async fn join(&self, group: &str) -> SessionSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.groups
            .write()
            .await
            .entry(group.to_string())
            .or_default()
            .insert(id, tx);
        debug!(group, session_id = id, "Session joined group");
        SessionSubscription {
            id,
            group: group.to_string(),
            receiver: rx,
        }
    }

    /// Remove a session. Empty groups are dropped.
    pub async fn leave(&self, group: &str, id: SessionId) {
        let mut groups = self.groups.write().await;
        if let Some(members) = groups.get_mut(group) {
            members.remove(&id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
        debug!(group, session_id = id, "Session left group");
    }

    pub async fn group_size(&self, group: &str) -> usize {
        self.groups.read().await.get(group).map_or(0, |m| m.len())
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn session_count(&self) -> usize {
        self.groups.read().await.values().map(|m| m.len()).sum()
    }
}

#[async_trait]
impl GroupSender for SessionGroups {
    async fn send_to_group(
        &self,
        group: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<usize, NotifyError> {
        let message = HubMessage {
            event: event.to_string(),
            data: payload,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let groups = self.groups.read().await;
            let Some(members) = groups.get(group) else {
                return Ok(0);
            };
            for (id, tx) in members {
                match tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(group, session_id = id, "Session buffer full, dropping frame");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        for id in closed {
            self.leave(group, id).await;
        }

        Ok(delivered)
    }
}
