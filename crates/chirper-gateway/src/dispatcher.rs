use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use chirper_types::{Path, SubscriptionError};

use crate::subscription::Subscription;

/// Capacity of the commit channel before slow subscribers start lagging.
const COMMIT_BUFFER: usize = 1024;

/// One committed write: the path it touched and the whole tree after it.
#[derive(Debug, Clone)]
pub struct Commit {
    pub revision: u64,
    pub path: Path,
    pub tree: Arc<Value>,
}

/// Fans committed trees out to every live subscription.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// `None` once the dispatcher has been closed.
    broadcast_tx: RwLock<Option<broadcast::Sender<Commit>>>,

    /// Most recent commit, used to seed new subscriptions and resync laggards.
    latest: RwLock<Commit>,
}

impl Dispatcher {
    pub fn new(initial: Commit) -> Self {
        let (broadcast_tx, _) = broadcast::channel(COMMIT_BUFFER);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx: RwLock::new(Some(broadcast_tx)),
                latest: RwLock::new(initial),
            }),
        }
    }

    /// Publish a commit. Callers must publish in revision order.
    pub fn publish(&self, commit: Commit) {
        debug!("commit r{} at {}", commit.revision, commit.path);
        *self.inner.latest.write().unwrap_or_else(|e| e.into_inner()) = commit.clone();

        if let Some(tx) = self.sender() {
            // No receivers is fine: nobody is watching yet.
            let _ = tx.send(commit);
        }
    }

    pub fn latest(&self) -> Commit {
        self.inner
            .latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    /// Watch `path`. The current value is delivered first.
    pub fn subscribe(&self, path: Path) -> Result<Subscription, SubscriptionError> {
        // Subscribe before reading `latest` so no commit falls between the two.
        let rx = self
            .sender()
            .ok_or(SubscriptionError::ConnectionLost)?
            .subscribe();
        let seed = self.latest();
        Ok(Subscription::spawn(path, seed, rx, self.clone()))
    }

    /// Drop the sender. Every live subscription ends with `ConnectionLost`.
    pub fn close(&self) {
        if self
            .inner
            .broadcast_tx
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            info!("Dispatcher closed");
        }
    }

    fn sender(&self) -> Option<broadcast::Sender<Commit>> {
        self.inner
            .broadcast_tx
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
