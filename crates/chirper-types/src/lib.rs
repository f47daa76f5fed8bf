pub mod api;
pub mod errors;
pub mod models;
pub mod path;
pub mod snapshot;

pub use api::{AuthSession, Claims, Identity, SignUpRequest};
pub use errors::{AuthError, SubscriptionError, WriteError};
pub use models::{Chirp, Entry, SharedDocument, User, UserProfile};
pub use path::{Path, PathError};
pub use snapshot::{ServerTimestamp, Snapshot};
