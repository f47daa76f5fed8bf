//! The hosted realtime store: a JSON node tree with server timestamps,
//! generated push keys, email/password accounts and per-client connections.
//!
//! All `Backend` methods are blocking. Async callers go through
//! [`Connection`], which moves database and hashing work onto
//! `spawn_blocking`.

pub mod auth;
pub mod connection;
pub mod push_id;
pub mod tree;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use serde_json::Value;
use tracing::{error, info};

use chirper_db::Database;
use chirper_gateway::{Commit, Dispatcher, Subscription};
use chirper_types::snapshot::is_timestamp_sentinel;
use chirper_types::{Path, Snapshot, SubscriptionError, WriteError};

pub use connection::Connection;

use push_id::PushIdGenerator;
use tree::Tree;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// SQLite file; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
    /// Reject reads, subscriptions and writes from signed-out clients.
    pub require_auth: bool,
    pub min_password_len: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            jwt_secret: "dev-secret-change-me".into(),
            token_ttl: chrono::Duration::days(30),
            require_auth: false,
            min_password_len: 6,
        }
    }
}

#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    db: Database,
    dispatcher: Dispatcher,
    state: Mutex<StoreState>,
    config: BackendConfig,
    next_client: AtomicU64,
}

struct StoreState {
    tree: Tree,
    revision: u64,
    push_ids: PushIdGenerator,
}

impl Backend {
    pub fn open(config: BackendConfig) -> anyhow::Result<Self> {
        let db = match &config.db_path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };

        let mut tree = Tree::new();
        for row in db.load_nodes()? {
            let value: Value = serde_json::from_str(&row.value)
                .with_context(|| format!("corrupt node '{}'", row.key))?;
            tree.set(&Path::root().child_key(&row.key)?, value, 0);
        }
        let revision = db.max_revision()?;

        let dispatcher = Dispatcher::new(Commit {
            revision,
            path: Path::root(),
            tree: Arc::new(tree.root()),
        });

        info!(
            "Backend ready at revision {} with {} top-level nodes",
            revision,
            tree.keys().count()
        );

        Ok(Self {
            inner: Arc::new(BackendInner {
                db,
                dispatcher,
                state: Mutex::new(StoreState {
                    tree,
                    revision,
                    push_ids: PushIdGenerator::new(),
                }),
                config,
                next_client: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    pub(crate) fn db(&self) -> &Database {
        &self.inner.db
    }

    /// Open a client connection. Must be called inside a tokio runtime.
    pub fn connect(&self) -> Connection {
        let id = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        Connection::open(self.clone(), id)
    }

    pub fn revision(&self) -> u64 {
        self.state().revision
    }

    pub fn read(&self, path: &Path) -> Result<Snapshot, SubscriptionError> {
        if self.is_shut_down() {
            return Err(SubscriptionError::ConnectionLost);
        }
        let state = self.state();
        Ok(Snapshot::new(path.clone(), state.tree.get(path), state.revision))
    }

    pub fn subscribe(&self, path: Path) -> Result<Subscription, SubscriptionError> {
        self.inner.dispatcher.subscribe(path)
    }

    /// Overwrite the subtree at `path`. Returns the revision the write is
    /// visible at; a write that changes nothing returns the current revision.
    pub fn set(&self, path: &Path, value: Value) -> Result<u64, WriteError> {
        let mut state = self.state();
        self.commit(&mut state, path, value)
    }

    /// Append `value` under a freshly generated key.
    pub fn push(&self, path: &Path, value: Value) -> Result<(String, u64), WriteError> {
        let mut state = self.state();
        let key = state.push_ids.next_id(chrono::Utc::now().timestamp_millis());
        let child = path.child_key(&key)?;
        let revision = self.commit(&mut state, &child, value)?;
        Ok((key, revision))
    }

    /// Stop serving. Live subscriptions end with `ConnectionLost`.
    pub fn shutdown(&self) {
        info!("Backend shutting down");
        self.inner.dispatcher.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.dispatcher.is_closed()
    }

    pub(crate) fn authorize(&self, token: Option<&str>) -> bool {
        !self.config().require_auth || token.is_some_and(|t| self.decode_token(t).is_ok())
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply, persist and publish one write while holding the state lock, so
    /// commits reach the dispatcher in revision order.
    fn commit(&self, state: &mut StoreState, path: &Path, value: Value) -> Result<u64, WriteError> {
        if self.is_shut_down() {
            return Err(WriteError::Disconnected);
        }

        if path.is_root() && !holds_children(&value) {
            return Err(WriteError::InvalidValue(format!(
                "the root holds an object or null, not {value}"
            )));
        }

        // Nothing in `state` changes until the write is on disk.
        let mut next = state.tree.clone();
        let now = chrono::Utc::now().timestamp_millis();
        if !next.set(path, value, now) {
            return Ok(state.revision);
        }
        let revision = state.revision + 1;

        if let Err(e) = self.persist(&next, path, revision) {
            error!("Failed to persist r{} at {}: {:#}", revision, path, e);
            return Err(WriteError::Internal(e.to_string()));
        }

        state.tree = next;
        state.revision = revision;
        self.inner.dispatcher.publish(Commit {
            revision,
            path: path.clone(),
            tree: Arc::new(state.tree.root()),
        });
        Ok(revision)
    }

    fn persist(&self, tree: &Tree, path: &Path, revision: u64) -> anyhow::Result<()> {
        let db = self.db();
        let persist_key = |key: &str| -> anyhow::Result<()> {
            match tree.top_level(key) {
                Some(value) => db.put_node(key, &serde_json::to_string(value)?, revision),
                None => db.delete_node(key, revision),
            }
        };

        match path.segments().first() {
            Some(key) => persist_key(key),
            None => {
                for row in db.load_nodes()? {
                    if tree.top_level(&row.key).is_none() {
                        db.delete_node(&row.key, revision)?;
                    }
                }
                tree.keys().try_for_each(|key| persist_key(key))
            }
        }
    }
}

fn holds_children(value: &Value) -> bool {
    value.is_null() || (value.is_object() && !is_timestamp_sentinel(value))
}
