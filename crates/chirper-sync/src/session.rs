use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use chirper_types::{AuthError, Identity, SignUpRequest, User, WriteError};

use crate::app::USERS;
use crate::binding::ReconnectPolicy;
use crate::store::{AuthBackend, Handle, RemoteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(Option<&Identity>) + Send + Sync>;

/// Owns the signed-in identity and tells listeners when it changes.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    auth: Arc<dyn AuthBackend>,
    store: Arc<dyn RemoteStore>,
    policy: ReconnectPolicy,
    current: Mutex<Option<Identity>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    /// Held across a state change and its delivery, so every listener sees
    /// changes in the order they happened.
    delivery: Mutex<()>,
    next_listener: AtomicU64,
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthBackend>, store: Arc<dyn RemoteStore>) -> Self {
        Self::with_policy(auth, store, ReconnectPolicy::default())
    }

    /// `policy` governs retries of the profile write during sign-up.
    pub fn with_policy(
        auth: Arc<dyn AuthBackend>,
        store: Arc<dyn RemoteStore>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                auth,
                store,
                policy,
                current: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                delivery: Mutex::new(()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.current().clone()
    }

    /// Register `listener`. It is called right away with the current
    /// identity, then once per sign-in or sign-out.
    ///
    /// Listeners run synchronously and must not register other listeners.
    pub fn on_auth_state_changed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Option<&Identity>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(listener);

        let _delivery = self.delivery();
        let current = self.current_user();
        self.listeners().push((id, listener.clone()));
        listener(current.as_ref());
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Create an identity and store its profile at `users/{uid}`.
    ///
    /// If the profile cannot be written after retrying, the new identity is
    /// deleted again and [`AuthError::ProfileWrite`] is returned, so no
    /// account is left without a profile.
    pub async fn sign_up(&self, request: SignUpRequest) -> Result<User, AuthError> {
        let SignUpRequest {
            email,
            password,
            profile,
        } = request;

        let identity = self
            .inner
            .auth
            .create_user(&email, &password)
            .await
            .inspect_err(|e| warn!("Sign-up for {} failed: {}", email, e))?;

        let written = match serde_json::to_value(&profile) {
            Ok(value) => self.write_profile(&identity.uid, value).await,
            Err(e) => Err(WriteError::from(e)),
        };

        if let Err(e) = written {
            error!("Profile write for {} failed, rolling back: {}", identity.uid, e);
            if let Err(del) = self.inner.auth.delete_user().await {
                error!("Could not delete identity {}: {}", identity.uid, del);
            }
            self.sign_out().await;
            return Err(AuthError::ProfileWrite(e));
        }

        info!("Signed up {} as {}", identity.uid, profile.handle);
        let user = User {
            id: identity.uid.clone(),
            profile,
        };
        self.transition(Some(identity));
        Ok(user)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let identity = self
            .inner
            .auth
            .sign_in(email, password)
            .await
            .inspect_err(|e| warn!("Sign-in for {} failed: {}", email, e))?;

        info!("Signed in {}", identity.uid);
        self.transition(Some(identity.clone()));
        Ok(identity)
    }

    /// Always leaves the manager signed out.
    pub async fn sign_out(&self) {
        if let Err(e) = self.inner.auth.sign_out().await {
            warn!("Backend sign-out failed: {}", e);
        }
        self.transition(None);
    }

    /// Re-validate the session with the backend. A rejected token signs out.
    pub async fn refresh(&self) -> Result<Option<Identity>, AuthError> {
        match self.inner.auth.refresh().await {
            Ok(identity) => {
                self.transition(identity.clone());
                Ok(identity)
            }
            Err(AuthError::InvalidToken) => {
                warn!("Session token rejected, signing out");
                self.transition(None);
                Err(AuthError::InvalidToken)
            }
            Err(e) => {
                warn!("Session refresh failed: {}", e);
                Err(e)
            }
        }
    }

    async fn write_profile(&self, uid: &str, value: serde_json::Value) -> Result<(), WriteError> {
        let at = Handle::root().child(USERS)?.child_key(uid)?;
        let policy = &self.inner.policy;

        let mut attempt = 0;
        loop {
            match self.inner.store.set(&at, value.clone()).await {
                Ok(_) => return Ok(()),
                Err(e @ (WriteError::Disconnected | WriteError::Internal(_)))
                    if attempt < policy.max_attempts =>
                {
                    attempt += 1;
                    warn!("Profile write to {} failed ({}), retry {}", at, e, attempt);
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn transition(&self, next: Option<Identity>) {
        let _delivery = self.delivery();
        let listeners: Vec<Listener> = {
            let mut current = self.current();
            if *current == next {
                return;
            }
            *current = next.clone();
            self.listeners().iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in listeners {
            listener(next.as_ref());
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<Identity>> {
        self.inner.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn delivery(&self) -> MutexGuard<'_, ()> {
        self.inner.delivery.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}
