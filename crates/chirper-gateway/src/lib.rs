pub mod dispatcher;
pub mod subscription;

pub use dispatcher::{Commit, Dispatcher};
pub use subscription::Subscription;
