//! Rust client for the OAE push notification service.
//!
//! A single websocket per signed-in user carries every channel subscription.
//! The crate is organized around that session:
//! - `push::client`: opens sessions and resolves the endpoint.
//! - `push::session`: authenticated session handle with subscribe/send.
//! - `push::aggregate`: folds bursts of related activities into one.

/// Push session, protocol, and transport modules.
pub mod push;

pub use push::client::{Identity, PushClient, PushError};
pub use push::proto::{Activity, EntityRole};
pub use push::session::{PendingReply, PushSession};
