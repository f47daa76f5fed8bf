use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use chirper_backend::Backend;
use chirper_types::{
    AuthError, Chirp, Entry, Identity, SharedDocument, SignUpRequest, SubscriptionError, User,
    UserProfile, WriteError,
};

use crate::list::ListBinding;
use crate::local::LocalStore;
use crate::object::ObjectBinding;
use crate::session::SessionManager;
use crate::store::{AuthBackend, Handle, RemoteStore, read_value};

pub const USERS: &str = "users";
pub const CHIRPS: &str = "chirps";
pub const CHIRPPAD: &str = "chirppad";

#[derive(Debug, Error)]
pub enum ChirperError {
    #[error("sign in first")]
    NotSignedIn,

    #[error("a chirp needs some text")]
    EmptyChirp,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

/// The micro-blogging app: profiles, a chirp feed and a shared scratch pad,
/// all mirrored live from the store.
pub struct Chirper {
    store: Arc<dyn RemoteStore>,
    session: SessionManager,
    users: ObjectBinding<BTreeMap<String, UserProfile>>,
    chirps: ListBinding<Chirp>,
    pad: ObjectBinding<SharedDocument>,
}

impl Chirper {
    /// Bind the feed, the pad and the user directory.
    pub async fn open(
        store: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthBackend>,
    ) -> Result<Self, ChirperError> {
        let root = store.connect();
        let session = SessionManager::new(auth, store.clone());

        let users = ObjectBinding::bind(store.clone(), root.child(USERS).map_err(WriteError::from)?).await?;
        let chirps = ListBinding::bind(store.clone(), root.child(CHIRPS).map_err(WriteError::from)?).await?;
        let pad = ObjectBinding::bind(store.clone(), root.child(CHIRPPAD).map_err(WriteError::from)?).await?;

        info!("Chirper ready with {} chirps", chirps.len());
        Ok(Self {
            store,
            session,
            users,
            chirps,
            pad,
        })
    }

    /// Open against an in-process backend over a fresh connection.
    pub async fn local(backend: &Backend) -> Result<Self, ChirperError> {
        let client = Arc::new(LocalStore::connect(backend));
        Self::open(client.clone(), client).await
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn chirps(&self) -> &ListBinding<Chirp> {
        &self.chirps
    }

    pub fn pad(&self) -> &ObjectBinding<SharedDocument> {
        &self.pad
    }

    pub fn users(&self) -> &ObjectBinding<BTreeMap<String, UserProfile>> {
        &self.users
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.session.current_user()
    }

    // -- Auth --

    pub async fn sign_up(&self, request: SignUpRequest) -> Result<User, ChirperError> {
        Ok(self.session.sign_up(request).await?)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, ChirperError> {
        Ok(self.session.sign_in(email, password).await?)
    }

    pub async fn sign_out(&self) {
        self.session.sign_out().await
    }

    // -- Chirps --

    /// Post as the signed-in user. Returns the new chirp's id.
    pub async fn post_chirp(&self, text: &str) -> Result<String, ChirperError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChirperError::EmptyChirp);
        }
        let author = self.session.current_user().ok_or(ChirperError::NotSignedIn)?;

        let id = self
            .chirps
            .add(Chirp::new(text, author.uid))
            .await
            .inspect_err(|e| warn!("Posting chirp failed: {}", e))?;
        info!("Posted chirp {}", id);
        Ok(id)
    }

    /// Add one like to `chirp` as this client last saw it and save it back.
    ///
    /// Two clients liking the same stale copy both write the same count, so
    /// one like is lost.
    pub async fn like(&self, chirp: &Entry<Chirp>) -> Result<u64, ChirperError> {
        let mut liked = chirp.clone();
        liked.likes += 1;
        let revision = self
            .chirps
            .save(&liked)
            .await
            .inspect_err(|e| warn!("Liking chirp {} failed: {}", chirp.id, e))?;
        Ok(revision)
    }

    // -- Pad --

    pub async fn edit_pad(&self, text: &str) -> Result<u64, ChirperError> {
        let revision = self
            .pad
            .set(SharedDocument { text: text.into() })
            .await
            .inspect_err(|e| warn!("Editing chirppad failed: {}", e))?;
        Ok(revision)
    }

    // -- Users --

    /// Handle of `uid` from the live directory.
    pub fn handle_for(&self, uid: &str) -> Option<String> {
        self.users
            .value()
            .and_then(|users| users.get(uid).map(|p| p.handle.clone()))
    }

    /// Fetch one profile straight from the store.
    pub async fn profile(&self, uid: &str) -> Result<Option<UserProfile>, ChirperError> {
        let at = Handle::root()
            .child(USERS)
            .and_then(|users| users.child_key(uid))
            .map_err(WriteError::from)?;
        Ok(read_value(self.store.as_ref(), &at).await?)
    }
}
