//! Push notification modules.
//!
//! - `client`: endpoint resolution, identity, and errors.
//! - `session`: the session task that serializes transport events, host
//!   requests, and aggregation timers.
//! - `connection`: lifecycle state machine and deferred request queue.
//! - `correlator`: request id allocation and acknowledgement matching.
//! - `registry`: channel subscriptions and listener fan-out.
//! - `aggregate`: trailing-edge merging of activity bursts.
//! - `proto`: frames exchanged with the push service.
//! - `transport`: websocket and in-process text frame transports.

/// Activity aggregation rules and per-group timers.
pub mod aggregate;
/// Client entry point, identity, and error types.
pub mod client;
/// Connection lifecycle and outbound request queue.
pub mod connection;
/// Request id allocation and acknowledgement matching.
pub mod correlator;
/// Push protocol frames and activity payloads.
pub mod proto;
/// Channel subscriptions and listeners.
pub mod registry;
/// Push session handle and its background task.
pub mod session;
/// Text frame transports.
pub mod transport;
