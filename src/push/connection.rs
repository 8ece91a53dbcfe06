//! Connection lifecycle and the outbound request path.
//!
//! `Connection` owns the write half of the transport. Requests issued before
//! the socket is authenticated wait in a FIFO queue that is flushed exactly
//! once, when the connection becomes ready.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::push::client::PushError;
use crate::push::correlator::Correlator;
use crate::push::proto::{RequestFrame, RequestId};

/// Lifecycle of the push connection.
///
/// Transitions only move forward, except `Ready -> Disconnected` when the
/// channel is lost. Nothing reconnects automatically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Failed,
}

impl ConnectionState {
    /// Whether the connection can still become ready.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating)
    }
}

/// Request that arrived before the connection was ready.
#[derive(Debug)]
struct DeferredAction<R> {
    name: String,
    payload: Value,
    responder: R,
}

/// Write half of the transport plus everything waiting on it.
///
/// `R` is whatever the owner attaches to a request to act on its
/// acknowledgement.
#[derive(Debug)]
pub struct Connection<R> {
    state: ConnectionState,
    outbound: mpsc::UnboundedSender<String>,
    correlator: Correlator<R>,
    deferred: VecDeque<DeferredAction<R>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<R> Connection<R> {
    /// Wraps a transport that is already opening.
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let mut connection = Self {
            state: ConnectionState::Disconnected,
            outbound,
            correlator: Correlator::new(),
            deferred: VecDeque::new(),
            state_tx,
        };
        connection.set_state(ConnectionState::Connecting);
        connection
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Sends the request now when ready, otherwise queues it.
    pub fn send(&mut self, name: String, payload: Value, responder: R) -> Result<(), PushError> {
        if self.state != ConnectionState::Ready {
            debug!(event = "request_deferred", name = %name, queued = self.deferred.len() + 1);
            self.deferred.push_back(DeferredAction {
                name,
                payload,
                responder,
            });
            return Ok(());
        }
        self.transmit(name, payload, responder).map(|_| ())
    }

    /// Writes a request frame regardless of readiness.
    ///
    /// Only the authentication handshake should bypass the queue this way.
    pub fn transmit(
        &mut self,
        name: String,
        payload: Value,
        responder: R,
    ) -> Result<RequestId, PushError> {
        let id = self.correlator.register(responder);
        let frame = RequestFrame { id, name, payload };
        let sent = frame
            .to_text()
            .map_err(PushError::from)
            .and_then(|text| {
                self.outbound
                    .send(text)
                    .map_err(|_| PushError::SessionClosed)
            });
        if let Err(err) = sent {
            self.correlator.resolve(id);
            return Err(err);
        }
        debug!(event = "request_sent", id, name = %frame.name);
        Ok(id)
    }

    /// The transport reported that it is open.
    pub fn on_open(&mut self) {
        info!(event = "push_connected");
        self.set_state(ConnectionState::Authenticating);
    }

    /// Authentication succeeded: becomes ready and flushes the queue in order.
    ///
    /// Returns how many deferred requests were written.
    pub fn on_authenticated(&mut self) -> Result<usize, PushError> {
        info!(event = "push_authenticated", deferred = self.deferred.len());
        self.set_state(ConnectionState::Ready);

        let mut flushed = 0;
        while let Some(action) = self.deferred.pop_front() {
            self.transmit(action.name, action.payload, action.responder)?;
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Authentication was rejected. Returns the requests that can now never
    /// be sent.
    pub fn on_rejected(&mut self) -> Vec<R> {
        self.set_state(ConnectionState::Failed);
        self.deferred
            .drain(..)
            .map(|action| action.responder)
            .collect()
    }

    /// The transport closed.
    pub fn on_closed(&mut self) {
        let next = if self.state == ConnectionState::Ready {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Failed
        };
        info!(event = "push_closed", from = ?self.state, to = ?next);
        self.set_state(next);
    }

    /// Explicit teardown by the owner.
    pub fn on_shutdown(&mut self) {
        if self.state != ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Takes the responder waiting on `id`, if any.
    pub fn resolve(&mut self, id: RequestId) -> Option<R> {
        self.correlator.resolve(id)
    }

    /// Every responder still waiting, in flight first and then queued.
    pub fn abandon_all(&mut self) -> Vec<R> {
        let mut abandoned: Vec<R> = self.correlator.drain().collect();
        abandoned.extend(self.deferred.drain(..).map(|action| action.responder));
        abandoned
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }
}
