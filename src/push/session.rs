//! Push session: one authenticated connection shared by every subscription.
//!
//! All session state (pending requests, deferred requests, subscriptions and
//! held aggregates) lives in a single background task. The [`PushSession`]
//! handle talks to it over a command queue, so the state is never touched
//! from two places at once and needs no locks. Transport events, host
//! commands, and aggregation timers are all serialized through that task.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::push::aggregate::{AggregationRules, Aggregator, Expiry, Offer, DEFAULT_AGGREGATION_WINDOW};
use crate::push::client::{Identity, PushError};
use crate::push::connection::{Connection, ConnectionState};
use crate::push::proto::{
    AckFrame, Activity, InboundFrame, NotificationFrame, StreamKey, SubscribePayload,
    AUTHENTICATION, SUBSCRIBE,
};
use crate::push::registry::{ActivityListener, Registration, SubscriptionRegistry};
use crate::push::transport::{TransportEvent, TransportLink};

/// Tunables for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub aggregation_rules: AggregationRules,
    pub aggregation_window: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            aggregation_rules: AggregationRules::default(),
            aggregation_window: DEFAULT_AGGREGATION_WINDOW,
        }
    }
}

type Reply = oneshot::Sender<Result<Value, PushError>>;

/// Acknowledgement of a request, resolved with the server's payload.
///
/// Resolves to [`PushError::SessionClosed`] if the session stops first. A
/// request the server never acknowledges never resolves.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Value, PushError>>,
}

impl PendingReply {
    fn ready(result: Result<Value, PushError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for PendingReply {
    type Output = Result<Value, PushError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PushError::SessionClosed)))
    }
}

enum Command {
    Send {
        name: String,
        payload: Value,
        reply: Reply,
    },
    Subscribe {
        key: StreamKey,
        token: String,
        listener: Box<dyn ActivityListener>,
        reply: Reply,
    },
    Close,
}

/// Handle to a push session.
///
/// Dropping the handle (or calling [`PushSession::close`]) ends the session:
/// the transport is closed, held aggregates are discarded, and outstanding
/// replies resolve to [`PushError::SessionClosed`].
///
/// Losing the channel does not discard anything already received: held
/// aggregates are still delivered when their windows close.
#[derive(Debug)]
pub struct PushSession {
    commands: Option<mpsc::UnboundedSender<Command>>,
    state: watch::Receiver<ConnectionState>,
    init: Option<oneshot::Receiver<Result<(), PushError>>>,
    worker: Option<JoinHandle<()>>,
}

impl PushSession {
    /// Starts a session over `link` and authenticates as `identity` once the
    /// transport opens.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(link: TransportLink, identity: Identity, options: SessionOptions) -> Self {
        let (outbound, events) = link.into_parts();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (init_tx, init_rx) = oneshot::channel();
        let (aggregator, expiries) =
            Aggregator::new(options.aggregation_rules, options.aggregation_window);

        let worker = SessionWorker {
            connection: Connection::new(outbound, state_tx),
            registry: SubscriptionRegistry::new(),
            aggregator,
            identity,
            init_tx: Some(init_tx),
        };
        let task = tokio::spawn(worker.run(command_rx, events, expiries));

        Self {
            commands: Some(command_tx),
            state: state_rx,
            init: Some(init_rx),
            worker: Some(task),
        }
    }

    /// Session for a user who is not signed in. It never connects.
    pub fn anonymous() -> Self {
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            commands: None,
            state: state_rx,
            init: None,
            worker: None,
        }
    }

    /// Whether this session was opened without an identity.
    pub fn is_anonymous(&self) -> bool {
        self.commands.is_none()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits for the outcome of connecting and authenticating.
    ///
    /// Anonymous sessions are ready immediately.
    pub async fn ready(&mut self) -> Result<(), PushError> {
        if self.is_anonymous() {
            return Ok(());
        }
        if let Some(init) = self.init.take() {
            return init.await.unwrap_or(Err(PushError::SessionClosed));
        }

        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Failed => {
                    return Err(PushError::Connection(
                        "session failed to authenticate".to_string(),
                    ))
                }
                ConnectionState::Disconnected => return Err(PushError::SessionClosed),
                ConnectionState::Connecting | ConnectionState::Authenticating => {
                    if state.changed().await.is_err() {
                        return Err(PushError::SessionClosed);
                    }
                }
            }
        }
    }

    /// Sends a named request; it waits in a queue until the session is ready.
    pub fn send(&self, name: impl Into<String>, payload: Value) -> PendingReply {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Send {
            name: name.into(),
            payload,
            reply,
        });
        PendingReply { rx }
    }

    /// Registers `listener` for every activity on a channel stream.
    ///
    /// Only the first subscription to a stream goes to the server; the reply
    /// resolves with its acknowledgement. Later subscriptions to the same
    /// stream are satisfied locally and resolve immediately. If the server
    /// rejects the request, the next subscription to that stream sends it
    /// again.
    pub fn subscribe<L>(
        &self,
        resource_id: impl Into<String>,
        stream_type: impl Into<String>,
        token: impl Into<String>,
        listener: L,
    ) -> PendingReply
    where
        L: ActivityListener,
    {
        if self.is_anonymous() {
            return PendingReply::ready(Ok(Value::Null));
        }
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Subscribe {
            key: StreamKey::new(resource_id, stream_type),
            token: token.into(),
            listener: Box::new(listener),
            reply,
        });
        PendingReply { rx }
    }

    /// Like [`PushSession::subscribe`], delivering activities into a channel.
    pub fn subscribe_channel(
        &self,
        resource_id: impl Into<String>,
        stream_type: impl Into<String>,
        token: impl Into<String>,
    ) -> (PendingReply, mpsc::UnboundedReceiver<Activity>) {
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        let reply = self.subscribe(
            resource_id,
            stream_type,
            token,
            move |activity: &Activity| {
                let _ = activity_tx.send(activity.clone());
            },
        );
        (reply, activity_rx)
    }

    /// Ends the session and waits for its task to finish.
    pub async fn close(mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Close);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }

    fn submit(&self, command: Command) {
        let Some(commands) = &self.commands else {
            reply_to(command, Err(PushError::Anonymous));
            return;
        };
        if let Err(mpsc::error::SendError(command)) = commands.send(command) {
            reply_to(command, Err(PushError::SessionClosed));
        }
    }
}

fn reply_to(command: Command, result: Result<Value, PushError>) {
    match command {
        Command::Send { reply, .. } | Command::Subscribe { reply, .. } => {
            let _ = reply.send(result);
        }
        Command::Close => {}
    }
}

/// Who is waiting on an acknowledgement.
enum Responder {
    Authentication,
    Subscribe { key: StreamKey, reply: Reply },
    Reply { name: String, reply: Reply },
}

struct SessionWorker {
    connection: Connection<Responder>,
    registry: SubscriptionRegistry,
    aggregator: Aggregator,
    identity: Identity,
    init_tx: Option<oneshot::Sender<Result<(), PushError>>>,
}

enum Flow {
    Continue,
    /// The channel is gone; deliver what is still held, then stop.
    Drain,
    Stop,
}

impl SessionWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut expiries: mpsc::UnboundedReceiver<Expiry>,
    ) {
        let flow = loop {
            let flow = tokio::select! {
                maybe_command = commands.recv() => match maybe_command {
                    Some(Command::Close) | None => Flow::Stop,
                    Some(command) => self.on_command(command),
                },
                maybe_event = events.recv() => match maybe_event {
                    Some(TransportEvent::Opened) => self.on_open(),
                    Some(TransportEvent::Frame(text)) => self.on_frame(&text),
                    Some(TransportEvent::Closed { reason }) => self.on_closed(reason),
                    None => self.on_closed(None),
                },
                Some(expiry) = expiries.recv() => {
                    if let Some(notification) = self.aggregator.expire(expiry) {
                        self.deliver(notification);
                    }
                    Flow::Continue
                }
            };
            if !matches!(flow, Flow::Continue) {
                break flow;
            }
        };
        if matches!(flow, Flow::Drain) {
            self.abandon_requests();
            self.drain(&mut commands, &mut expiries).await;
        }
        self.shutdown();
    }

    /// Runs the held aggregates to completion after the channel is lost.
    ///
    /// Requests made meanwhile fail at once. An explicit close still discards
    /// whatever is held.
    async fn drain(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        expiries: &mut mpsc::UnboundedReceiver<Expiry>,
    ) {
        if self.aggregator.pending() > 0 {
            debug!(event = "aggregate_drain", held = self.aggregator.pending());
        }
        while self.aggregator.pending() > 0 {
            tokio::select! {
                maybe_command = commands.recv() => match maybe_command {
                    Some(Command::Close) | None => return,
                    Some(command) => reply_to(command, Err(PushError::SessionClosed)),
                },
                Some(expiry) = expiries.recv() => {
                    if let Some(notification) = self.aggregator.expire(expiry) {
                        self.deliver(notification);
                    }
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Send {
                name,
                payload,
                reply,
            } => self.send(name, payload, reply),
            Command::Subscribe {
                key,
                token,
                listener,
                reply,
            } => match self.registry.register(key.clone(), listener) {
                Registration::Joined => {
                    debug!(event = "subscription_joined", stream = %key);
                    let _ = reply.send(Ok(Value::Null));
                }
                Registration::Created => self.request_subscription(key, token, reply),
            },
            Command::Close => return Flow::Stop,
        }
        Flow::Continue
    }

    fn send(&mut self, name: String, payload: Value, reply: Reply) {
        let responder = Responder::Reply {
            name: name.clone(),
            reply,
        };
        if let Err(err) = self.connection.send(name.clone(), payload, responder) {
            warn!(event = "request_send_failed", name = %name, error = %err);
        }
    }

    fn request_subscription(&mut self, key: StreamKey, token: String, reply: Reply) {
        let payload = SubscribePayload {
            stream: key.to_msg(),
            token,
        };
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                self.registry.reject(&key);
                let _ = reply.send(Err(err.into()));
                return;
            }
        };
        let responder = Responder::Subscribe {
            key: key.clone(),
            reply,
        };
        if let Err(err) = self
            .connection
            .send(SUBSCRIBE.to_string(), payload, responder)
        {
            warn!(event = "request_send_failed", name = SUBSCRIBE, error = %err);
            self.registry.reject(&key);
        }
    }

    fn abandon_requests(&mut self) {
        for abandoned in self.connection.abandon_all() {
            fail(abandoned, PushError::SessionClosed);
        }
    }

    fn on_open(&mut self) -> Flow {
        self.connection.on_open();
        let payload = match serde_json::to_value(self.identity.authentication_payload()) {
            Ok(payload) => payload,
            Err(err) => {
                self.finish_init(Err(err.into()));
                return Flow::Stop;
            }
        };
        match self
            .connection
            .transmit(AUTHENTICATION.to_string(), payload, Responder::Authentication)
        {
            Ok(_) => Flow::Continue,
            Err(err) => {
                self.finish_init(Err(err));
                Flow::Stop
            }
        }
    }

    /// Parses and routes one inbound frame. Malformed frames are dropped.
    fn on_frame(&mut self, text: &str) -> Flow {
        match InboundFrame::from_text(text) {
            Ok(InboundFrame::Notification(notification)) => {
                self.on_notification(notification);
                Flow::Continue
            }
            Ok(InboundFrame::Acknowledgement(ack)) => self.on_acknowledgement(ack),
            Err(err) => {
                warn!(event = "frame_dropped", error = %err, len = text.len());
                Flow::Continue
            }
        }
    }

    fn on_notification(&mut self, notification: NotificationFrame) {
        match self.aggregator.offer(notification) {
            Offer::Deliver(notification) => self.deliver(notification),
            Offer::Held => {}
        }
    }

    fn on_acknowledgement(&mut self, ack: AckFrame) -> Flow {
        let Some(responder) = self.connection.resolve(ack.id) else {
            debug!(event = "ack_unmatched", id = ack.id);
            return Flow::Continue;
        };
        debug!(event = "ack_resolved", id = ack.id, error = ack.error.is_some());

        match responder {
            Responder::Authentication => match ack.error {
                None => self.on_authenticated(),
                Some(error) => {
                    warn!(event = "push_authentication_rejected", error = %error);
                    for abandoned in self.connection.on_rejected() {
                        fail(
                            abandoned,
                            PushError::Connection("authentication rejected".to_string()),
                        );
                    }
                    self.finish_init(Err(PushError::AuthenticationRejected(error)));
                    Flow::Stop
                }
            },
            Responder::Subscribe { key, reply } => {
                let result = match ack.error {
                    Some(error) => {
                        warn!(event = "subscription_refused", stream = %key, error = %error);
                        self.registry.reject(&key);
                        Err(PushError::Rejected {
                            name: SUBSCRIBE.to_string(),
                            error,
                        })
                    }
                    None => Ok(ack.payload.unwrap_or(Value::Null)),
                };
                let _ = reply.send(result);
                Flow::Continue
            }
            Responder::Reply { name, reply } => {
                let result = match ack.error {
                    Some(error) => Err(PushError::Rejected { name, error }),
                    None => Ok(ack.payload.unwrap_or(Value::Null)),
                };
                let _ = reply.send(result);
                Flow::Continue
            }
        }
    }

    fn on_authenticated(&mut self) -> Flow {
        if let Err(err) = self.connection.on_authenticated() {
            warn!(event = "deferred_flush_failed", error = %err);
        }
        self.finish_init(Ok(()));
        Flow::Continue
    }

    fn on_closed(&mut self, reason: Option<String>) -> Flow {
        let was_pending = self.connection.state().is_pending();
        self.connection.on_closed();
        if was_pending {
            let reason = reason.unwrap_or_else(|| "transport closed".to_string());
            self.finish_init(Err(PushError::Connection(reason)));
        }
        Flow::Drain
    }

    fn deliver(&mut self, notification: NotificationFrame) {
        let key = notification.key();
        let delivered = self.registry.notify(&key, &notification.activity);
        debug!(event = "notification_delivered", stream = %key, listeners = delivered);
    }

    fn finish_init(&mut self, result: Result<(), PushError>) {
        if let Some(init_tx) = self.init_tx.take() {
            let _ = init_tx.send(result);
        }
    }

    fn shutdown(&mut self) {
        self.aggregator.cancel_all();
        self.connection.on_shutdown();
        self.abandon_requests();
        self.finish_init(Err(PushError::SessionClosed));
        info!(event = "push_session_closed", state = ?self.connection.state());
    }
}

fn fail(responder: Responder, err: PushError) {
    match responder {
        Responder::Subscribe { reply, .. } | Responder::Reply { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Responder::Authentication => {}
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tokio::time::timeout;

    use super::{PushSession, SessionOptions};
    use crate::push::client::{Identity, PushError};
    use crate::push::connection::ConnectionState;
    use crate::push::proto::EntityRole;
    use crate::push::transport::{TransportLink, TransportPeer};

    const WAIT: Duration = Duration::from_secs(2);

    fn identity() -> Identity {
        Identity::new("u1", "t1", SecretString::new("s".to_string()))
    }

    fn start() -> (PushSession, TransportPeer) {
        let (link, peer) = TransportLink::pair();
        let session = PushSession::start(link, identity(), SessionOptions::default());
        (session, peer)
    }

    async fn next_frame(peer: &mut TransportPeer) -> Value {
        let text = timeout(WAIT, peer.recv_frame())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("session closed its transport");
        serde_json::from_str(&text).expect("outbound frame is json")
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    /// Opens the transport and acknowledges authentication.
    async fn authenticate(session: &mut PushSession, peer: &mut TransportPeer) {
        peer.open().expect("open");
        let auth = next_frame(peer).await;
        assert_eq!(auth["name"], "authentication");
        peer.deliver(json!({"id": auth["id"], "payload": {}}).to_string())
            .expect("ack");
        timeout(WAIT, session.ready())
            .await
            .expect("timed out waiting for ready")
            .expect("authenticated");
    }

    fn created(object: &str, published: i64) -> String {
        json!({
            "resourceId": "u1",
            "streamType": "activity",
            "activity": {
                "oae:activityType": "content-create",
                "published": published,
                "actor": {"oae:id": "alice"},
                "object": {"oae:id": object}
            }
        })
        .to_string()
    }

    fn ack(peer: &TransportPeer, id: &Value) {
        peer.deliver(json!({"id": id, "payload": {}}).to_string())
            .expect("ack");
    }

    #[tokio::test]
    async fn end_to_end_authenticate_subscribe_and_notify() {
        let (mut session, mut peer) = start();
        assert_eq!(session.state(), ConnectionState::Connecting);

        peer.open().expect("open");
        assert_eq!(
            next_frame(&mut peer).await,
            json!({
                "id": 1,
                "name": "authentication",
                "payload": {"userId": "u1", "tenantAlias": "t1", "signature": "s"}
            })
        );
        peer.deliver(r#"{"id":1,"payload":{}}"#).expect("ack");
        session.ready().await.expect("ready");
        assert_eq!(session.state(), ConnectionState::Ready);

        let (subscribed, mut activities) = session.subscribe_channel("c1", "activity", "tok");
        assert_eq!(
            next_frame(&mut peer).await,
            json!({
                "id": 2,
                "name": "subscribe",
                "payload": {
                    "stream": {"resourceId": "c1", "activityStreamId": "activity"},
                    "token": "tok"
                }
            })
        );
        peer.deliver(r#"{"id":2,"payload":{}}"#).expect("ack");
        timeout(WAIT, subscribed)
            .await
            .expect("timed out waiting for subscription")
            .expect("subscribed");

        peer.deliver(
            r#"{"resourceId":"c1","streamType":"activity","activity":{"oae:activityType":"generic-event","published":100}}"#,
        )
        .expect("notification");
        let activity = timeout(WAIT, activities.recv())
            .await
            .expect("timed out waiting for activity")
            .expect("activity");
        assert_eq!(activity.activity_type(), Some("generic-event"));
        assert_eq!(activity.published(), Some(&json!(100)));
    }

    #[tokio::test]
    async fn requests_before_ready_flush_in_call_order_after_authentication() {
        let (mut session, mut peer) = start();

        let first = session.subscribe_channel("c1", "activity", "t1").0;
        let second = session.subscribe_channel("c2", "activity", "t2").0;
        let custom = session.send("ping", json!({"n": 3}));
        settle().await;
        assert!(peer.try_recv_frame().is_none());

        authenticate(&mut session, &mut peer).await;

        let frames = [
            next_frame(&mut peer).await,
            next_frame(&mut peer).await,
            next_frame(&mut peer).await,
        ];
        assert_eq!(frames[0]["payload"]["stream"]["resourceId"], "c1");
        assert_eq!(frames[1]["payload"]["stream"]["resourceId"], "c2");
        assert_eq!(frames[2]["name"], "ping");
        assert_eq!(frames[2]["payload"], json!({"n": 3}));
        let ids: Vec<u64> = frames.iter().filter_map(|frame| frame["id"].as_u64()).collect();
        assert_eq!(ids, vec![2, 3, 4]);

        for frame in &frames {
            ack(&peer, &frame["id"]);
        }
        first.await.expect("first subscription");
        second.await.expect("second subscription");
        custom.await.expect("custom request");
    }

    #[tokio::test]
    async fn repeated_subscriptions_send_a_single_request() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;

        let (first, mut first_rx) = session.subscribe_channel("c1", "activity", "tok");
        let (second, mut second_rx) = session.subscribe_channel("c1", "activity", "tok");
        let (third, _third_rx) = session.subscribe_channel("c1", "activity", "tok");

        let request = next_frame(&mut peer).await;
        assert_eq!(request["name"], "subscribe");
        timeout(WAIT, second).await.expect("second resolves").expect("joined");
        timeout(WAIT, third).await.expect("third resolves").expect("joined");
        settle().await;
        assert!(peer.try_recv_frame().is_none());

        ack(&peer, &request["id"]);
        timeout(WAIT, first).await.expect("first resolves").expect("subscribed");

        peer.deliver(
            r#"{"resourceId":"c1","streamType":"activity","activity":{"oae:activityType":"generic-event"}}"#,
        )
        .expect("notification");
        assert!(timeout(WAIT, first_rx.recv()).await.expect("first listener").is_some());
        assert!(timeout(WAIT, second_rx.recv()).await.expect("second listener").is_some());
    }

    #[tokio::test]
    async fn duplicate_acknowledgement_resolves_once() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;

        let reply = session.send("ping", json!({}));
        let request = next_frame(&mut peer).await;
        ack(&peer, &request["id"]);
        ack(&peer, &request["id"]);
        reply.await.expect("acknowledged");

        let (subscribed, _activities) = session.subscribe_channel("c1", "activity", "tok");
        let subscribe = next_frame(&mut peer).await;
        assert_eq!(subscribe["id"], 3);
        ack(&peer, &subscribe["id"]);
        subscribed.await.expect("session still healthy after duplicate ack");
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn unmatched_acknowledgement_is_ignored() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;

        peer.deliver(r#"{"id":999,"payload":{}}"#).expect("stray ack");
        let reply = session.send("ping", json!({}));
        let request = next_frame(&mut peer).await;
        ack(&peer, &request["id"]);
        reply.await.expect("session keeps working");
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_and_later_frames_still_route() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;
        let (subscribed, mut activities) = session.subscribe_channel("c1", "activity", "tok");
        let request = next_frame(&mut peer).await;
        ack(&peer, &request["id"]);
        subscribed.await.expect("subscribed");

        peer.deliver("not json").expect("garbage");
        peer.deliver(
            r#"{"resourceId":"c1","streamType":"activity","activity":{"oae:activityType":"generic-event","published":7}}"#,
        )
        .expect("notification");

        let activity = timeout(WAIT, activities.recv())
            .await
            .expect("timed out")
            .expect("activity");
        assert_eq!(activity.published(), Some(&json!(7)));
        settle().await;
        assert!(activities.try_recv().is_err());
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn notification_for_unknown_stream_is_dropped() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;
        let (subscribed, mut activities) = session.subscribe_channel("c1", "activity", "tok");
        let request = next_frame(&mut peer).await;
        ack(&peer, &request["id"]);
        subscribed.await.expect("subscribed");

        peer.deliver(
            r#"{"resourceId":"c2","streamType":"activity","activity":{"oae:activityType":"generic-event"}}"#,
        )
        .expect("notification");
        settle().await;
        assert!(activities.try_recv().is_err());
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn rejected_subscription_only_fails_that_call() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;

        let rejected = session.subscribe_channel("c1", "activity", "bad-token").0;
        let request = next_frame(&mut peer).await;
        peer.deliver(json!({"id": request["id"], "error": {"code": 401, "msg": "denied"}}).to_string())
            .expect("rejection");

        match timeout(WAIT, rejected).await.expect("resolves") {
            Err(PushError::Rejected { name, error }) => {
                assert_eq!(name, "subscribe");
                assert_eq!(error["code"], 401);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let other = session.subscribe_channel("c2", "activity", "tok").0;
        let request = next_frame(&mut peer).await;
        ack(&peer, &request["id"]);
        other.await.expect("unrelated subscription succeeds");
    }

    #[tokio::test]
    async fn rejected_authentication_fails_init_and_queued_requests() {
        let (mut session, mut peer) = start();
        let queued = session.subscribe_channel("c1", "activity", "tok").0;

        peer.open().expect("open");
        let auth = next_frame(&mut peer).await;
        peer.deliver(json!({"id": auth["id"], "error": {"code": 401}}).to_string())
            .expect("rejection");

        assert!(matches!(
            session.ready().await,
            Err(PushError::AuthenticationRejected(_))
        ));
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(matches!(queued.await, Err(PushError::Connection(_))));
        assert!(matches!(
            session.send("ping", json!({})).await,
            Err(PushError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn transport_closing_before_authentication_fails_init() {
        let (mut session, peer) = start();
        peer.close(Some("refused".to_string())).expect("close");

        match session.ready().await {
            Err(PushError::Connection(reason)) => assert_eq!(reason, "refused"),
            other => panic!("expected connection error, got {other:?}"),
        }
        assert_eq!(session.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn losing_a_ready_channel_disconnects_the_session() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;
        let pending = session.send("ping", json!({}));
        next_frame(&mut peer).await;

        peer.close(None).expect("close");
        assert!(matches!(pending.await, Err(PushError::SessionClosed)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.ready().await.is_err());
    }

    #[tokio::test]
    async fn close_ends_the_session_and_the_transport() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;

        session.close().await;
        assert_eq!(timeout(WAIT, peer.recv_frame()).await.expect("closed"), None);
    }

    #[tokio::test]
    async fn anonymous_session_never_connects() {
        let mut session = PushSession::anonymous();
        session.ready().await.expect("anonymous is ready");
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let (subscribed, _activities) = session.subscribe_channel("c1", "activity", "tok");
        subscribed.await.expect("subscription is a no-op");
        assert!(matches!(
            session.send("ping", json!({})).await,
            Err(PushError::Anonymous)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_creations_is_delivered_as_one_aggregate() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;
        let (subscribed, mut activities) = session.subscribe_channel("u1", "activity", "tok");
        let request = next_frame(&mut peer).await;
        ack(&peer, &request["id"]);
        subscribed.await.expect("subscribed");

        peer.deliver(created("doc-1", 100)).expect("first");
        tokio::time::advance(Duration::from_millis(300)).await;
        peer.deliver(created("doc-2", 200)).expect("second");
        settle().await;
        assert!(activities.try_recv().is_err());

        let activity = activities.recv().await.expect("aggregate");
        let object = activity.entity(EntityRole::Object).expect("object");
        assert_eq!(object["objectType"], "collection");
        assert_eq!(object["oae:collection"].as_array().map(Vec::len), Some(2));
        assert_eq!(activity.published(), Some(&json!(200)));

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert!(activities.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn held_aggregate_is_delivered_after_channel_loss() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;
        let (subscribed, mut activities) = session.subscribe_channel("u1", "activity", "tok");
        let request = next_frame(&mut peer).await;
        ack(&peer, &request["id"]);
        subscribed.await.expect("subscribed");

        peer.deliver(created("doc-1", 100)).expect("first");
        peer.deliver(created("doc-2", 200)).expect("second");
        peer.close(None).expect("close");
        settle().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(matches!(
            session.send("ping", json!({})).await,
            Err(PushError::SessionClosed)
        ));

        let activity = activities.recv().await.expect("aggregate survives channel loss");
        assert_eq!(
            activity
                .entity(EntityRole::Object)
                .and_then(|object| object["oae:collection"].as_array())
                .map(Vec::len),
            Some(2)
        );
        assert!(activities.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_discards_held_aggregates() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;
        let (subscribed, mut activities) = session.subscribe_channel("u1", "activity", "tok");
        let request = next_frame(&mut peer).await;
        ack(&peer, &request["id"]);
        subscribed.await.expect("subscribed");

        peer.deliver(created("doc-1", 100)).expect("first");
        settle().await;
        session.close().await;
        assert!(activities.recv().await.is_none());
    }

    #[tokio::test]
    async fn rejected_subscription_can_be_retried() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;

        let rejected = session.subscribe_channel("c1", "activity", "bad-token").0;
        let request = next_frame(&mut peer).await;
        peer.deliver(json!({"id": request["id"], "error": {"code": 401}}).to_string())
            .expect("rejection");
        assert!(matches!(
            timeout(WAIT, rejected).await.expect("resolves"),
            Err(PushError::Rejected { .. })
        ));

        let (retry, mut activities) = session.subscribe_channel("c1", "activity", "tok");
        let request = next_frame(&mut peer).await;
        assert_eq!(request["name"], "subscribe");
        assert_eq!(request["payload"]["token"], "tok");
        ack(&peer, &request["id"]);
        timeout(WAIT, retry).await.expect("resolves").expect("retry accepted");

        peer.deliver(
            r#"{"resourceId":"c1","streamType":"activity","activity":{"oae:activityType":"generic-event"}}"#,
        )
        .expect("notification");
        let activity = timeout(WAIT, activities.recv())
            .await
            .expect("timed out")
            .expect("activity");
        assert_eq!(activity.activity_type(), Some("generic-event"));
    }

    #[tokio::test]
    async fn loosely_shaped_activities_still_reach_listeners() {
        let (mut session, mut peer) = start();
        authenticate(&mut session, &mut peer).await;
        let (subscribed, mut activities) = session.subscribe_channel("c1", "activity", "tok");
        let request = next_frame(&mut peer).await;
        ack(&peer, &request["id"]);
        subscribed.await.expect("subscribed");

        for published in [json!("2013-05-01T10:00:00Z"), json!(1.5e12)] {
            peer.deliver(
                json!({
                    "resourceId": "c1",
                    "streamType": "activity",
                    "activity": {"oae:activityType": "generic-event", "published": published}
                })
                .to_string(),
            )
            .expect("notification");
            let activity = timeout(WAIT, activities.recv())
                .await
                .expect("timed out")
                .expect("activity");
            assert_eq!(activity.published(), Some(&published));
        }
    }
}
