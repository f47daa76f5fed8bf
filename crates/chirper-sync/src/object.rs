use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use chirper_types::{Snapshot, SubscriptionError, WriteError};

use crate::binding::{self, BindingState, Model, ReconnectPolicy};
use crate::store::{Handle, RemoteStore};

/// Mirrors one remote node into a local `Option<T>`.
///
/// Remote snapshots replace the local value. Local changes are explicit:
/// [`set`](Self::set), [`update`](Self::update) and [`remove`](Self::remove)
/// apply optimistically and return the write's completion.
///
/// While any of our writes is in flight, incoming snapshots are held back so
/// echoes of older states cannot clobber newer local edits. When the last
/// write settles the newest known server state is applied. A rejected write
/// reverts to that state as well.
pub struct ObjectBinding<T: Model> {
    store: Arc<dyn RemoteStore>,
    handle: Handle,
    shared: Arc<Shared<T>>,
    task: JoinHandle<()>,
}

struct Shared<T> {
    value: watch::Sender<Option<T>>,
    state: Arc<watch::Sender<BindingState>>,
    tracker: Mutex<Tracker<T>>,
}

struct Tracker<T> {
    in_flight: usize,
    failed: bool,
    /// Our newest committed write.
    committed: Option<Versioned<T>>,
    /// Newest snapshot received from the store.
    remote: Option<Versioned<T>>,
}

#[derive(Clone)]
struct Versioned<T> {
    revision: u64,
    value: Option<T>,
}

impl<T: Model> ObjectBinding<T> {
    pub async fn bind(store: Arc<dyn RemoteStore>, handle: Handle) -> Result<Self, SubscriptionError> {
        Self::bind_with(store, handle, ReconnectPolicy::default()).await
    }

    /// Resolves once the initial value has arrived.
    pub async fn bind_with(
        store: Arc<dyn RemoteStore>,
        handle: Handle,
        policy: ReconnectPolicy,
    ) -> Result<Self, SubscriptionError> {
        let (sub, initial) = binding::open(store.as_ref(), &handle).await?;
        let value = decode::<T>(&initial)?;

        let shared = Arc::new(Shared {
            value: watch::channel(value.clone()).0,
            state: Arc::new(watch::channel(BindingState::Live).0),
            tracker: Mutex::new(Tracker {
                in_flight: 0,
                failed: false,
                committed: None,
                remote: Some(Versioned {
                    revision: initial.revision,
                    value,
                }),
            }),
        });

        let apply_to = shared.clone();
        let task = tokio::spawn(binding::drive(
            store.clone(),
            handle.clone(),
            sub,
            policy,
            shared.state.clone(),
            move |snapshot| apply_to.on_snapshot(snapshot),
        ));

        debug!("Object binding on {} live", handle);
        Ok(Self {
            store,
            handle,
            shared,
            task,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Current local value, `None` when the node is absent.
    pub fn value(&self) -> Option<T> {
        self.shared.value.borrow().clone()
    }

    /// Observe local value changes.
    pub fn watch(&self) -> watch::Receiver<Option<T>> {
        self.shared.value.subscribe()
    }

    pub fn state(&self) -> BindingState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<BindingState> {
        self.shared.state.subscribe()
    }

    /// Replace the remote value. Applied locally at once.
    pub fn set(&self, value: T) -> impl Future<Output = Result<u64, WriteError>> + Send + use<T> {
        self.write(Some(value))
    }

    /// Delete the remote node.
    pub fn remove(&self) -> impl Future<Output = Result<u64, WriteError>> + Send + use<T> {
        self.write(None)
    }

    /// Edit the current value (or the default when absent) and write it back.
    pub fn update<F>(&self, f: F) -> BoxFuture<'static, Result<u64, WriteError>>
    where
        T: Default,
        F: FnOnce(&mut T),
    {
        let mut value = self.value().unwrap_or_default();
        f(&mut value);
        self.set(value).boxed()
    }

    /// Stop mirroring. Writes already issued still complete.
    pub fn unbind(self) {
        debug!("Object binding on {} closed", self.handle);
    }

    /// The write settles in its own task, so the tracker stays balanced even
    /// when the caller drops the returned future.
    fn write(&self, value: Option<T>) -> impl Future<Output = Result<u64, WriteError>> + Send + use<T> {
        let encoded = match &value {
            Some(v) => serde_json::to_value(v).map_err(WriteError::from),
            None => Ok(serde_json::Value::Null),
        };
        let settled = encoded.map(|json| {
            self.shared.begin_write(value.clone());
            let pending = self.store.set(&self.handle, json);
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let result = pending.await;
                shared.finish_write(&result, value);
                result
            })
        });

        async move {
            settled?.await.unwrap_or_else(|e| {
                error!("Binding write task failed: {}", e);
                Err(WriteError::Internal(e.to_string()))
            })
        }
    }
}

impl<T: Model> Drop for ObjectBinding<T> {
    fn drop(&mut self) {
        self.task.abort();
        self.shared.state.send_replace(BindingState::Closed);
    }
}

impl<T: Model> Shared<T> {
    fn on_snapshot(&self, snapshot: Snapshot) {
        let value = match decode::<T>(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring snapshot r{} of {}: {}", snapshot.revision, snapshot.path, e);
                return;
            }
        };

        let mut tracker = self.lock();
        let incoming = Versioned {
            revision: snapshot.revision,
            value,
        };
        tracker.remote = Some(incoming.clone());

        let committed_rev = tracker.committed.as_ref().map_or(0, |c| c.revision);
        if tracker.in_flight == 0 && incoming.revision >= committed_rev {
            self.show(incoming.value);
        }
    }

    fn begin_write(&self, value: Option<T>) {
        let mut tracker = self.lock();
        tracker.in_flight += 1;
        self.show(value);
    }

    fn finish_write(&self, result: &Result<u64, WriteError>, written: Option<T>) {
        let mut tracker = self.lock();
        tracker.in_flight -= 1;

        match result {
            Ok(revision) => {
                if tracker.committed.as_ref().is_none_or(|c| *revision >= c.revision) {
                    tracker.committed = Some(Versioned {
                        revision: *revision,
                        value: written,
                    });
                }
            }
            Err(_) => tracker.failed = true,
        }

        if tracker.in_flight > 0 {
            return;
        }

        let committed_rev = tracker.committed.as_ref().map_or(0, |c| c.revision);
        let remote_newer = tracker
            .remote
            .as_ref()
            .is_some_and(|r| r.revision > committed_rev);

        if remote_newer {
            let remote = tracker.remote.as_ref().and_then(|r| r.value.clone());
            self.show(remote);
        } else if tracker.failed {
            let fallback = match &tracker.committed {
                Some(c) => c.value.clone(),
                None => tracker.remote.as_ref().and_then(|r| r.value.clone()),
            };
            self.show(fallback);
        }
        tracker.failed = false;
    }

    fn show(&self, value: Option<T>) {
        self.value.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tracker<T>> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn decode<T: Model>(snapshot: &Snapshot) -> Result<Option<T>, SubscriptionError> {
    snapshot
        .deserialize()
        .map_err(|e| SubscriptionError::Decode(e.to_string()))
}
