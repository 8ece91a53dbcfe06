//! Duplex text-frame transport between a push session and the network.
//!
//! A session only ever sees a [`TransportLink`]: an outbound queue of text
//! frames and an inbound stream of [`TransportEvent`]s. [`connect_websocket`]
//! backs a link with a real websocket; [`TransportLink::pair`] hands the other
//! end to the caller so any channel (or a test) can drive the session.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::push::client::PushError;

/// Event raised by the transport towards the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel is open and frames may be written.
    Opened,
    /// One inbound text frame.
    Frame(String),
    /// The channel is gone. Nothing follows this event.
    Closed { reason: Option<String> },
}

/// Session end of a transport.
#[derive(Debug)]
pub struct TransportLink {
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Transport end of a link.
#[derive(Debug)]
pub struct TransportPeer {
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl TransportLink {
    /// Creates a connected link/peer pair.
    pub fn pair() -> (TransportLink, TransportPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = TransportLink {
            outbound: outbound_tx,
            events: events_rx,
        };
        let peer = TransportPeer {
            events: events_tx,
            outbound: outbound_rx,
        };
        (link, peer)
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        (self.outbound, self.events)
    }
}

impl TransportPeer {
    /// Reports that the channel is open.
    pub fn open(&self) -> Result<(), PushError> {
        self.emit(TransportEvent::Opened)
    }

    /// Hands one inbound text frame to the session.
    pub fn deliver(&self, text: impl Into<String>) -> Result<(), PushError> {
        self.emit(TransportEvent::Frame(text.into()))
    }

    /// Reports that the channel closed.
    pub fn close(&self, reason: Option<String>) -> Result<(), PushError> {
        self.emit(TransportEvent::Closed { reason })
    }

    /// Next frame the session wants written, or `None` once the session is
    /// gone.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Like [`TransportPeer::recv_frame`] without waiting.
    pub fn try_recv_frame(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    fn emit(&self, event: TransportEvent) -> Result<(), PushError> {
        self.events
            .send(event)
            .map_err(|_| PushError::SessionClosed)
    }
}

/// Opens a websocket to `url` and returns the session end of it.
///
/// The socket is connected by a background task; the link reports
/// [`TransportEvent::Opened`] once the handshake completes, or
/// [`TransportEvent::Closed`] if it fails.
pub fn connect_websocket(url: &str) -> Result<TransportLink, PushError> {
    let request = url.into_client_request()?;
    let (link, peer) = TransportLink::pair();
    tokio::spawn(websocket_worker(request, peer));
    Ok(link)
}

async fn websocket_worker(request: Request, mut peer: TransportPeer) {
    let uri = request.uri().to_string();
    let mut socket = match connect_async(request).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            warn!(event = "websocket_connect_failed", uri = %uri, error = %err);
            let _ = peer.close(Some(err.to_string()));
            return;
        }
    };
    debug!(event = "websocket_open", uri = %uri);
    if peer.open().is_err() {
        let _ = socket.close(None).await;
        return;
    }

    loop {
        tokio::select! {
            maybe_outbound = peer.outbound.recv() => {
                match maybe_outbound {
                    Some(text) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            warn!(event = "websocket_send_failed", error = %err);
                            let _ = peer.close(Some(err.to_string()));
                            return;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if peer.deliver(text).is_err() {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            let _ = peer.close(Some(err.to_string()));
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let _ = peer.close(frame.map(|frame| frame.reason.to_string()));
                        return;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(event = "websocket_binary_ignored");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "websocket_read_failed", error = %err);
                        let _ = peer.close(Some(err.to_string()));
                        return;
                    }
                    None => {
                        let _ = peer.close(None);
                        return;
                    }
                }
            }
        }
    }
}
