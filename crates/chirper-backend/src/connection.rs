use std::future::Future;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use chirper_gateway::Subscription;
use chirper_types::{AuthError, AuthSession, Identity, Path, Snapshot, SubscriptionError, WriteError};

use crate::Backend;

/// One client's session with the backend.
///
/// Writes are queued in call order and committed one at a time by a
/// dedicated task, so two writes from the same connection always commit in
/// the order they were issued. The queue position is taken when `set` or
/// `push` is called, not when the returned future is first polled.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    backend: Backend,
    session: RwLock<Option<AuthSession>>,
    writes: mpsc::UnboundedSender<WriteRequest>,
}

enum WriteOp {
    Set { path: Path, value: Value },
    Push { path: Path, value: Value },
}

struct Written {
    key: Option<String>,
    revision: u64,
}

struct WriteRequest {
    op: WriteOp,
    /// Session token captured when the write was issued.
    token: Option<String>,
    reply: oneshot::Sender<Result<Written, WriteError>>,
}

impl Connection {
    pub(crate) fn open(backend: Backend, id: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(backend.clone(), id, rx));

        info!("Client {} connected", id);
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                backend,
                session: RwLock::new(None),
                writes: tx,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    pub fn identity(&self) -> Option<Identity> {
        self.session_guard().as_ref().map(|s| s.identity.clone())
    }

    // -- Data --

    pub fn read(&self, path: &Path) -> Result<Snapshot, SubscriptionError> {
        self.check_read(path)?;
        self.inner.backend.read(path)
    }

    pub fn subscribe(&self, path: Path) -> Result<Subscription, SubscriptionError> {
        self.check_read(&path)?;
        debug!("Client {} subscribing to {}", self.inner.id, path);
        self.inner.backend.subscribe(path)
    }

    /// Queue an overwrite. Resolves with the commit revision.
    pub fn set(
        &self,
        path: Path,
        value: Value,
    ) -> impl Future<Output = Result<u64, WriteError>> + Send + use<> {
        let reply = self.enqueue(WriteOp::Set { path, value });
        async move { Ok(reply.await.map_err(|_| WriteError::Disconnected)??.revision) }
    }

    /// Queue an append. Resolves with the generated key and commit revision.
    pub fn push(
        &self,
        path: Path,
        value: Value,
    ) -> impl Future<Output = Result<(String, u64), WriteError>> + Send + use<> {
        let reply = self.enqueue(WriteOp::Push { path, value });
        async move {
            let written = reply.await.map_err(|_| WriteError::Disconnected)??;
            let key = written
                .key
                .ok_or_else(|| WriteError::Internal("push committed without a key".into()))?;
            Ok((key, written.revision))
        }
    }

    // -- Auth --

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let (email, password) = (email.to_string(), password.to_string());
        let session = self
            .blocking_auth(move |backend| backend.create_account(&email, &password))
            .await?;
        Ok(self.install(session))
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let (email, password) = (email.to_string(), password.to_string());
        let session = self
            .blocking_auth(move |backend| backend.sign_in(&email, &password))
            .await?;
        Ok(self.install(session))
    }

    /// Forget the session. Returns the identity that was signed in, if any.
    pub fn sign_out(&self) -> Option<Identity> {
        let previous = self
            .inner
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|s| s.identity);
        if let Some(identity) = &previous {
            info!("Client {} signed out {}", self.inner.id, identity.uid);
        }
        previous
    }

    /// Re-validate the session token. An invalid token signs the client out.
    pub async fn refresh(&self) -> Result<Option<Identity>, AuthError> {
        let Some(token) = self.token() else {
            return Ok(None);
        };

        match self.blocking_auth(move |backend| backend.verify_token(&token)).await {
            Ok(identity) => Ok(Some(identity)),
            Err(AuthError::InvalidToken) => {
                warn!("Client {} session token rejected", self.inner.id);
                self.sign_out();
                Err(AuthError::InvalidToken)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the signed-in account and sign out.
    pub async fn delete_account(&self) -> Result<(), AuthError> {
        let token = self.token().ok_or(AuthError::NotSignedIn)?;
        self.blocking_auth(move |backend| backend.delete_account(&token))
            .await?;
        self.sign_out();
        Ok(())
    }

    fn install(&self, session: AuthSession) -> Identity {
        let identity = session.identity.clone();
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(session);
        info!("Client {} authenticated as {}", self.inner.id, identity.uid);
        identity
    }

    async fn blocking_auth<F, T>(&self, f: F) -> Result<T, AuthError>
    where
        F: FnOnce(&Backend) -> Result<T, AuthError> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.backend.is_shut_down() {
            return Err(AuthError::Disconnected);
        }
        let backend = self.inner.backend.clone();
        tokio::task::spawn_blocking(move || f(&backend))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                AuthError::Internal(e.to_string())
            })?
    }

    fn token(&self) -> Option<String> {
        self.session_guard().as_ref().map(|s| s.token.clone())
    }

    fn session_guard(&self) -> std::sync::RwLockReadGuard<'_, Option<AuthSession>> {
        self.inner.session.read().unwrap_or_else(|e| e.into_inner())
    }

    fn check_read(&self, path: &Path) -> Result<(), SubscriptionError> {
        if self.inner.backend.authorize(self.token().as_deref()) {
            Ok(())
        } else {
            Err(SubscriptionError::PermissionDenied { path: path.clone() })
        }
    }

    fn enqueue(&self, op: WriteOp) -> oneshot::Receiver<Result<Written, WriteError>> {
        let (reply, rx) = oneshot::channel();
        let request = WriteRequest {
            op,
            token: self.token(),
            reply,
        };
        if let Err(mpsc::error::SendError(request)) = self.inner.writes.send(request) {
            let _ = request.reply.send(Err(WriteError::Disconnected));
        }
        rx
    }
}

/// Commits queued writes in order until every handle to the connection is gone.
async fn run_writer(backend: Backend, client: u64, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
    while let Some(WriteRequest { op, token, reply }) = rx.recv().await {
        let backend = backend.clone();
        let result = tokio::task::spawn_blocking(move || apply(&backend, op, token.as_deref()))
            .await
            .unwrap_or_else(|e| {
                error!("spawn_blocking join error: {}", e);
                Err(WriteError::Internal(e.to_string()))
            });

        if let Err(e) = &result {
            warn!("Client {} write rejected: {}", client, e);
        }
        // The caller may have dropped the completion; the write still stands.
        let _ = reply.send(result);
    }
    info!("Client {} disconnected", client);
}

fn apply(backend: &Backend, op: WriteOp, token: Option<&str>) -> Result<Written, WriteError> {
    let path = match &op {
        WriteOp::Set { path, .. } | WriteOp::Push { path, .. } => path,
    };
    if !backend.authorize(token) {
        return Err(WriteError::PermissionDenied { path: path.clone() });
    }

    match op {
        WriteOp::Set { path, value } => backend.set(&path, value).map(|revision| Written {
            key: None,
            revision,
        }),
        WriteOp::Push { path, value } => backend.push(&path, value).map(|(key, revision)| Written {
            key: Some(key),
            revision,
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::BackendConfig;

    fn p(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn writes_commit_in_call_order() {
        let backend = Backend::open(BackendConfig::default()).unwrap();
        let conn = backend.connect();

        // Issue both before awaiting either.
        let first = conn.set(p("chirppad/text"), json!("A"));
        let second = conn.set(p("chirppad/text"), json!("AB"));
        let (a, b) = tokio::join!(second, first);

        assert!(b.unwrap() < a.unwrap());
        assert_eq!(conn.read(&p("chirppad/text")).unwrap().value, Some(json!("AB")));
    }

    #[tokio::test]
    async fn push_returns_key_of_stored_child() {
        let backend = Backend::open(BackendConfig::default()).unwrap();
        let conn = backend.connect();

        let (key, _) = conn.push(p("chirps"), json!({"text": "hi"})).await.unwrap();
        let snap = conn.read(&p("chirps").child(&key).unwrap()).unwrap();
        assert_eq!(snap.value, Some(json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn require_auth_gates_reads_and_writes() {
        let backend = Backend::open(BackendConfig {
            require_auth: true,
            ..Default::default()
        })
        .unwrap();
        let conn = backend.connect();

        assert!(matches!(
            conn.subscribe(p("chirps")),
            Err(SubscriptionError::PermissionDenied { .. })
        ));
        assert_eq!(
            conn.set(p("chirppad/text"), json!("x")).await.unwrap_err(),
            WriteError::PermissionDenied { path: p("chirppad/text") }
        );

        conn.sign_up("ada@example.com", "hunter22").await.unwrap();
        conn.set(p("chirppad/text"), json!("x")).await.unwrap();
        assert!(conn.subscribe(p("chirps")).is_ok());

        conn.sign_out();
        assert!(conn.read(&p("chirppad")).is_err());
    }

    #[tokio::test]
    async fn refresh_after_account_removal_signs_out() {
        let backend = Backend::open(BackendConfig::default()).unwrap();
        let conn = backend.connect();
        let other = backend.connect();

        let identity = conn.sign_up("ada@example.com", "hunter22").await.unwrap();
        assert_eq!(conn.refresh().await.unwrap(), Some(identity.clone()));

        other.sign_in("ada@example.com", "hunter22").await.unwrap();
        other.delete_account().await.unwrap();
        assert_eq!(other.identity(), None);

        assert_eq!(conn.refresh().await.unwrap_err(), AuthError::InvalidToken);
        assert_eq!(conn.identity(), None);
        assert_eq!(conn.refresh().await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_work() {
        let backend = Backend::open(BackendConfig::default()).unwrap();
        let conn = backend.connect();
        backend.shutdown();

        assert_eq!(
            conn.set(p("a"), json!(1)).await.unwrap_err(),
            WriteError::Disconnected
        );
        assert_eq!(
            conn.sign_in("ada@example.com", "hunter22").await.unwrap_err(),
            AuthError::Disconnected
        );
    }
}
