//! Live observers over persistent connections.
//!
//! Observers subscribe to a target (a device ID, a view or edit token, or
//! `*` for the public listing) and receive `refresh` whenever the state
//! behind it changes. Staleness is detected lazily when a target is
//! notified; there is no separate reaper.

mod dispatcher;
mod hub;
mod protocol;
mod registry;
mod session;

pub use dispatcher::Notifier;
pub use hub::Hub;
pub use registry::Signal;
pub use session::{Flow, Session};
