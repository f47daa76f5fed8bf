use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use serde_json::Value;

use chirper_backend::{Backend, Connection};
use chirper_gateway::Subscription;
use chirper_types::{AuthError, Identity, Snapshot, SubscriptionError, WriteError};

use crate::store::{AuthBackend, Handle, RemoteStore};

/// Client for an in-process [`Backend`], one connection per instance.
#[derive(Clone)]
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    /// Must be called inside a tokio runtime.
    pub fn connect(backend: &Backend) -> Self {
        Self {
            conn: backend.connect(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RemoteStore for LocalStore {
    fn read(&self, at: &Handle) -> BoxFuture<'static, Result<Snapshot, SubscriptionError>> {
        future::ready(self.conn.read(at.path())).boxed()
    }

    fn subscribe(&self, at: &Handle) -> Result<Subscription, SubscriptionError> {
        self.conn.subscribe(at.path().clone())
    }

    fn set(&self, at: &Handle, value: Value) -> BoxFuture<'static, Result<u64, WriteError>> {
        self.conn.set(at.path().clone(), value).boxed()
    }

    fn push(&self, at: &Handle, value: Value) -> BoxFuture<'static, Result<String, WriteError>> {
        self.conn
            .push(at.path().clone(), value)
            .map(|result| result.map(|(key, _)| key))
            .boxed()
    }
}

impl AuthBackend for LocalStore {
    fn create_user(
        &self,
        email: &str,
        password: &str,
    ) -> BoxFuture<'static, Result<Identity, AuthError>> {
        let conn = self.conn.clone();
        let (email, password) = (email.to_string(), password.to_string());
        async move { conn.sign_up(&email, &password).await }.boxed()
    }

    fn sign_in(&self, email: &str, password: &str) -> BoxFuture<'static, Result<Identity, AuthError>> {
        let conn = self.conn.clone();
        let (email, password) = (email.to_string(), password.to_string());
        async move { conn.sign_in(&email, &password).await }.boxed()
    }

    fn sign_out(&self) -> BoxFuture<'static, Result<(), AuthError>> {
        self.conn.sign_out();
        future::ready(Ok(())).boxed()
    }

    fn refresh(&self) -> BoxFuture<'static, Result<Option<Identity>, AuthError>> {
        let conn = self.conn.clone();
        async move { conn.refresh().await }.boxed()
    }

    fn delete_user(&self) -> BoxFuture<'static, Result<(), AuthError>> {
        let conn = self.conn.clone();
        async move { conn.delete_account().await }.boxed()
    }
}
