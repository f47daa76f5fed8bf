//! Client side of Chirper: a store abstraction, live object and list
//! bindings with reconnect, session handling and the app facade.

pub mod app;
pub mod binding;
pub mod list;
pub mod local;
pub mod object;
pub mod session;
pub mod store;

pub use app::{CHIRPPAD, CHIRPS, Chirper, ChirperError, USERS};
pub use binding::{BindingState, Model, ReconnectPolicy};
pub use list::{ListBinding, ListEvent};
pub use local::LocalStore;
pub use object::ObjectBinding;
pub use session::{ListenerId, SessionManager};
pub use store::{AuthBackend, Handle, RemoteStore, read_value};
