use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chirper_types::snapshot::value_at;
use chirper_types::{Path, Snapshot, SubscriptionError};

use crate::dispatcher::{Commit, Dispatcher};

type Item = Result<Snapshot, SubscriptionError>;

/// A live stream of snapshots for one path.
///
/// The first item is the value at subscribe time. After that an item is
/// produced for every commit that changes the value at the path, in commit
/// order. Dropping the subscription stops the watcher task.
pub struct Subscription {
    path: Path,
    rx: mpsc::UnboundedReceiver<Item>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn(
        path: Path,
        seed: Commit,
        commits: broadcast::Receiver<Commit>,
        dispatcher: Dispatcher,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = Watcher {
            path: path.clone(),
            last: None,
            revision: 0,
            tx,
        };
        // The seed is always delivered, even when the node is absent.
        let initial = value_at(&seed.tree, &path).cloned();
        watcher.revision = seed.revision;
        watcher.last = initial.clone();
        let _ = watcher
            .tx
            .send(Ok(Snapshot::new(path.clone(), initial, seed.revision)));

        let task = tokio::spawn(watcher.run(commits, dispatcher));
        Self { path, rx, task }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next snapshot, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Item> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {
        debug!("unsubscribed from {}", self.path);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Watcher {
    path: Path,
    last: Option<Value>,
    revision: u64,
    tx: mpsc::UnboundedSender<Item>,
}

impl Watcher {
    async fn run(mut self, mut commits: broadcast::Receiver<Commit>, dispatcher: Dispatcher) {
        loop {
            tokio::select! {
                _ = self.tx.closed() => break,
                result = commits.recv() => {
                    let (commit, resync) = match result {
                        Ok(commit) => (commit, false),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Subscription on {} lagged by {} commits, resyncing", self.path, n);
                            (dispatcher.latest(), true)
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = self.tx.send(Err(SubscriptionError::ConnectionLost));
                            break;
                        }
                    };

                    if !self.offer(commit, resync) {
                        break;
                    }
                }
            }
        }
    }

    /// Returns false once the receiving side is gone.
    fn offer(&mut self, commit: Commit, resync: bool) -> bool {
        if commit.revision <= self.revision {
            return true;
        }
        self.revision = commit.revision;

        // A resync covers every commit skipped since the lag, whatever its path.
        if !resync && !commit.path.overlaps(&self.path) {
            return true;
        }

        let value = value_at(&commit.tree, &self.path).cloned();
        if value == self.last {
            return true;
        }
        self.last = value.clone();

        self.tx
            .send(Ok(Snapshot::new(self.path.clone(), value, commit.revision)))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn commit(revision: u64, path: &str, tree: Value) -> Commit {
        Commit {
            revision,
            path: Path::parse(path).unwrap(),
            tree: Arc::new(tree),
        }
    }

    #[tokio::test]
    async fn delivers_seed_then_changes_only() {
        let dispatcher = Dispatcher::new(commit(1, "chirppad", json!({"chirppad": {"text": "a"}})));
        let mut sub = dispatcher.subscribe(Path::parse("chirppad").unwrap()).unwrap();

        let first = sub.next().await.unwrap().unwrap();
        assert_eq!(first.value, Some(json!({"text": "a"})));
        assert_eq!(first.revision, 1);

        // unrelated write, then a write that leaves the pad unchanged
        dispatcher.publish(commit(2, "chirps", json!({"chirppad": {"text": "a"}, "chirps": {"x": 1}})));
        dispatcher.publish(commit(3, "chirppad/text", json!({"chirppad": {"text": "a"}, "chirps": {"x": 1}})));
        dispatcher.publish(commit(4, "chirppad", json!({"chirppad": {"text": "ab"}, "chirps": {"x": 1}})));

        let next = sub.next().await.unwrap().unwrap();
        assert_eq!(next.revision, 4);
        assert_eq!(next.value, Some(json!({"text": "ab"})));
    }

    #[test]
    fn commits_on_unrelated_paths_are_not_inspected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut watcher = Watcher {
            path: Path::parse("chirppad").unwrap(),
            last: None,
            revision: 0,
            tx,
        };

        // The tree shows a pad value, but the commit only touched `chirps`.
        let unrelated = commit(1, "chirps/x", json!({"chirppad": {"text": "a"}}));
        assert!(watcher.offer(unrelated.clone(), false));
        assert_eq!(watcher.last, None);
        assert_eq!(watcher.revision, 1);

        let mut resync = unrelated;
        resync.revision = 2;
        assert!(watcher.offer(resync, true));
        assert_eq!(watcher.last, Some(json!({"text": "a"})));

        assert!(watcher.offer(commit(3, "", json!({"chirppad": {"text": "b"}})), false));
        assert_eq!(watcher.last, Some(json!({"text": "b"})));
    }

    #[tokio::test]
    async fn missing_node_is_delivered_as_absent() {
        let dispatcher = Dispatcher::new(commit(0, "", json!({})));
        let mut sub = dispatcher.subscribe(Path::parse("users/u1").unwrap()).unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap().value, None);
    }

    #[tokio::test]
    async fn close_ends_stream_with_connection_lost() {
        let dispatcher = Dispatcher::new(commit(0, "", json!({})));
        let mut sub = dispatcher.subscribe(Path::root()).unwrap();
        sub.next().await.unwrap().unwrap();

        dispatcher.close();
        assert_eq!(sub.next().await, Some(Err(SubscriptionError::ConnectionLost)));
        assert_eq!(sub.next().await, None);

        assert!(dispatcher.is_closed());
        assert!(matches!(
            dispatcher.subscribe(Path::root()),
            Err(SubscriptionError::ConnectionLost)
        ));
    }
}
