use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chirper_types::{Entry, Snapshot, SubscriptionError, WriteError};

use crate::binding::{self, BindingState, Model, ReconnectPolicy};
use crate::store::{Handle, RemoteStore};

const EVENT_BUFFER: usize = 256;

/// A change to a bound collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ListEvent<T> {
    /// `prev_id` is the entry now directly before this one, if any.
    Added {
        entry: Entry<T>,
        prev_id: Option<String>,
    },
    Changed {
        entry: Entry<T>,
    },
    Removed {
        id: String,
    },
}

/// Mirrors the children of one remote node as a key-ordered list.
///
/// Entries only change in response to snapshots from the store, so an
/// [`add`](Self::add) shows up once the backend echo arrives.
pub struct ListBinding<T: Model> {
    store: Arc<dyn RemoteStore>,
    handle: Handle,
    shared: Arc<Shared<T>>,
    task: JoinHandle<()>,
}

struct Shared<T> {
    entries: watch::Sender<Vec<Entry<T>>>,
    events: broadcast::Sender<ListEvent<T>>,
    state: Arc<watch::Sender<BindingState>>,
    revision: Mutex<u64>,
}

impl<T: Model> ListBinding<T> {
    pub async fn bind(store: Arc<dyn RemoteStore>, handle: Handle) -> Result<Self, SubscriptionError> {
        Self::bind_with(store, handle, ReconnectPolicy::default()).await
    }

    /// Resolves once the initial contents have arrived.
    pub async fn bind_with(
        store: Arc<dyn RemoteStore>,
        handle: Handle,
        policy: ReconnectPolicy,
    ) -> Result<Self, SubscriptionError> {
        let (sub, initial) = binding::open(store.as_ref(), &handle).await?;
        let entries = decode_children::<T>(&initial);
        debug!("List binding on {} live with {} entries", handle, entries.len());

        let shared = Arc::new(Shared {
            entries: watch::channel(entries).0,
            events: broadcast::channel(EVENT_BUFFER).0,
            state: Arc::new(watch::channel(BindingState::Live).0),
            revision: Mutex::new(initial.revision),
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

    /// Append `value` under a generated key. Resolves with that key.
    pub fn add(&self, value: T) -> impl Future<Output = Result<String, WriteError>> + Send + use<T> {
        let queued = serde_json::to_value(&value)
            .map_err(WriteError::from)
            .map(|json| self.store.push(&self.handle, json));
        async move { queued?.await }
    }

    /// Overwrite the stored child with `entry`'s full value.
    pub fn save(&self, entry: &Entry<T>) -> impl Future<Output = Result<u64, WriteError>> + Send + use<T> {
        let queued = self.handle.child_key(&entry.id).map_err(WriteError::from).and_then(|at| {
            let json = serde_json::to_value(&entry.value)?;
            Ok(self.store.set(&at, json))
        });
        async move { queued?.await }
    }

    pub fn remove(&self, id: &str) -> impl Future<Output = Result<u64, WriteError>> + Send + use<T> {
        let queued = self
            .handle
            .child_key(id)
            .map_err(WriteError::from)
            .map(|at| self.store.remove(&at));
        async move { queued?.await }
    }

    /// Current entries in key order.
    pub fn entries(&self) -> Vec<Entry<T>> {
        self.shared.entries.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<Entry<T>> {
        let entries = self.shared.entries.borrow();
        entries
            .binary_search_by(|e| e.id.as_str().cmp(id))
            .ok()
            .map(|i| entries[i].clone())
    }

    pub fn len(&self) -> usize {
        self.shared.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events for changes applied after this call.
    pub fn events(&self) -> broadcast::Receiver<ListEvent<T>> {
        self.shared.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Entry<T>>> {
        self.shared.entries.subscribe()
    }

    /// Wait until `pred` holds for the entries and return them.
    pub async fn wait_until<F>(&self, mut pred: F) -> Vec<Entry<T>>
    where
        F: FnMut(&[Entry<T>]) -> bool,
    {
        let mut rx = self.shared.entries.subscribe();
        match rx.wait_for(|entries| pred(entries)).await {
            Ok(entries) => entries.clone(),
            Err(_) => self.entries(),
        }
    }

    pub fn state(&self) -> BindingState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<BindingState> {
        self.shared.state.subscribe()
    }

    /// Stop mirroring. Writes already issued still complete.
    pub fn unbind(self) {
        debug!("List binding on {} closed", self.handle);
    }
}

impl<T: Model> Drop for ListBinding<T> {
    fn drop(&mut self) {
        self.task.abort();
        self.shared.state.send_replace(BindingState::Closed);
    }
}

impl<T: Model> Shared<T> {
    fn on_snapshot(&self, snapshot: Snapshot) {
        let mut last = self.revision.lock().unwrap_or_else(|e| e.into_inner());
        if snapshot.revision < *last {
            debug!("Dropping stale r{} of {}", snapshot.revision, snapshot.path);
            return;
        }
        *last = snapshot.revision;

        let incoming = decode_children::<T>(&snapshot);
        let events = diff(&self.entries.borrow(), &incoming);
        if events.is_empty() {
            return;
        }

        debug!("r{} of {}: {} list events", snapshot.revision, snapshot.path, events.len());
        self.entries.send_replace(incoming);
        for event in events {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }
}

fn decode_children<T: Model>(snapshot: &Snapshot) -> Vec<Entry<T>> {
    snapshot
        .children()
        .filter_map(|(id, value)| match serde_json::from_value::<T>(value.clone()) {
            Ok(value) => Some(Entry::new(id.clone(), value)),
            Err(e) => {
                warn!("Skipping {}/{}: {}", snapshot.path, id, e);
                None
            }
        })
        .collect()
}

/// Events turning `old` into `new`: removals first, then adds and changes in
/// key order. Both inputs are sorted by id.
fn diff<T: Clone + PartialEq>(old: &[Entry<T>], new: &[Entry<T>]) -> Vec<ListEvent<T>> {
    let before: BTreeMap<&str, &T> = old.iter().map(|e| (e.id.as_str(), &e.value)).collect();
    let after: BTreeMap<&str, &T> = new.iter().map(|e| (e.id.as_str(), &e.value)).collect();

    let mut events: Vec<ListEvent<T>> = before
        .keys()
        .filter(|id| !after.contains_key(*id))
        .map(|id| ListEvent::Removed { id: id.to_string() })
        .collect();

    let mut prev_id: Option<&str> = None;
    for entry in new {
        match before.get(entry.id.as_str()) {
            None => events.push(ListEvent::Added {
                entry: entry.clone(),
                prev_id: prev_id.map(str::to_string),
            }),
            Some(old) if **old != entry.value => events.push(ListEvent::Changed {
                entry: entry.clone(),
            }),
            Some(_) => {}
        }
        prev_id = Some(&entry.id);
    }
    events
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use chirper_types::Path;

    use super::*;

    fn entries(pairs: &[(&str, u32)]) -> Vec<Entry<u32>> {
        pairs.iter().map(|(id, v)| Entry::new(*id, *v)).collect()
    }

    #[test]
    fn diff_orders_removals_before_adds_and_changes() {
        let old = entries(&[("a", 1), ("b", 2), ("c", 3)]);
        let new = entries(&[("a", 1), ("b", 5), ("d", 4)]);

        assert_eq!(
            diff(&old, &new),
            vec![
                ListEvent::Removed { id: "c".into() },
                ListEvent::Changed {
                    entry: Entry::new("b", 5)
                },
                ListEvent::Added {
                    entry: Entry::new("d", 4),
                    prev_id: Some("b".into()),
                },
            ]
        );
    }

    #[test]
    fn identical_snapshots_produce_no_events() {
        let list = entries(&[("a", 1), ("b", 2)]);
        assert!(diff(&list, &list).is_empty());
    }

    #[test]
    fn undecodable_children_are_skipped() {
        let snap = Snapshot::new(
            Path::parse("nums").unwrap(),
            Some(json!({"a": 1, "b": "two", "c": 3})),
            7,
        );
        let decoded = decode_children::<u32>(&snap);
        assert_eq!(decoded, entries(&[("a", 1), ("c", 3)]));
    }

    #[test]
    fn applying_a_snapshot_twice_is_a_no_op() {
        let shared = Shared::<u32> {
            entries: watch::channel(Vec::new()).0,
            events: broadcast::channel(EVENT_BUFFER).0,
            state: Arc::new(watch::channel(BindingState::Live).0),
            revision: Mutex::new(0),
        };
        let mut events = shared.events.subscribe();
        let snap = Snapshot::new(Path::parse("nums").unwrap(), Some(json!({"a": 1})), 1);

        shared.on_snapshot(snap.clone());
        shared.on_snapshot(snap);

        assert_eq!(shared.entries.borrow().len(), 1);
        assert!(matches!(events.try_recv(), Ok(ListEvent::Added { .. })));
        assert!(events.try_recv().is_err());
    }
}
