use std::fmt;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use chirper_gateway::Subscription;
use chirper_types::snapshot::timestamp_sentinel;
use chirper_types::{AuthError, Identity, Path, PathError, Snapshot, SubscriptionError, WriteError};

/// A reference to one location in the remote tree. Navigation is pure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Handle {
    path: Path,
}

impl Handle {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn at(path: Path) -> Self {
        Self { path }
    }

    pub fn child(&self, path: &str) -> Result<Handle, PathError> {
        Ok(Self {
            path: self.path.child(path)?,
        })
    }

    /// One level down by a single key, such as a record id. Keys holding `/`
    /// or nothing are rejected rather than parsed as a path.
    pub fn child_key(&self, key: &str) -> Result<Handle, PathError> {
        Ok(Self {
            path: self.path.child_key(key)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> Option<&str> {
        self.path.key()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.path, f)
    }
}

/// A hierarchical realtime key-value store.
///
/// Write methods queue the write when called and return its completion;
/// dropping the returned future does not cancel the write.
pub trait RemoteStore: Send + Sync {
    /// Root reference. Calling it again yields an equal handle.
    fn connect(&self) -> Handle {
        Handle::root()
    }

    fn read(&self, at: &Handle) -> BoxFuture<'static, Result<Snapshot, SubscriptionError>>;

    /// Stream of snapshots for `at`, starting with the current value.
    fn subscribe(&self, at: &Handle) -> Result<Subscription, SubscriptionError>;

    /// Overwrite the subtree at `at`. Resolves with the commit revision.
    fn set(&self, at: &Handle, value: Value) -> BoxFuture<'static, Result<u64, WriteError>>;

    /// Append under a generated key. Resolves with that key.
    fn push(&self, at: &Handle, value: Value) -> BoxFuture<'static, Result<String, WriteError>>;

    fn remove(&self, at: &Handle) -> BoxFuture<'static, Result<u64, WriteError>> {
        self.set(at, Value::Null)
    }

    /// Placeholder the backend replaces with its clock at commit time.
    fn server_timestamp(&self) -> Value {
        timestamp_sentinel()
    }
}

/// Email/password identity service of the backend.
pub trait AuthBackend: Send + Sync {
    fn create_user(&self, email: &str, password: &str)
        -> BoxFuture<'static, Result<Identity, AuthError>>;

    fn sign_in(&self, email: &str, password: &str) -> BoxFuture<'static, Result<Identity, AuthError>>;

    fn sign_out(&self) -> BoxFuture<'static, Result<(), AuthError>>;

    /// Re-validate the current session; `Ok(None)` when signed out.
    fn refresh(&self) -> BoxFuture<'static, Result<Option<Identity>, AuthError>>;

    /// Delete the signed-in identity.
    fn delete_user(&self) -> BoxFuture<'static, Result<(), AuthError>>;
}

/// One-shot typed read.
pub async fn read_value<T: DeserializeOwned>(
    store: &dyn RemoteStore,
    at: &Handle,
) -> Result<Option<T>, SubscriptionError> {
    store
        .read(at)
        .await?
        .deserialize()
        .map_err(|e| SubscriptionError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_navigate_without_io() {
        let root = Handle::root();
        let chirp = root.child("chirps").unwrap().child("abc").unwrap();
        assert_eq!(chirp.to_string(), "chirps/abc");
        assert_eq!(chirp.key(), Some("abc"));
        assert_eq!(root, Handle::at(Path::root()));
        assert!(root.child("bad.key").is_err());
    }
}
