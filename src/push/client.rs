//! Push client configuration, identity, and errors.
//!
//! `PushClient` resolves the push endpoint and opens authenticated
//! [`PushSession`]s over a websocket.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::push::aggregate::AggregationRules;
use crate::push::proto::AuthenticationPayload;
use crate::push::session::{PushSession, SessionOptions};
use crate::push::transport::connect_websocket;

/// Path of the raw websocket endpoint of the push service.
pub const PUSH_WEBSOCKET_PATH: &str = "/api/push/websocket";

/// Entry point for opening push sessions.
#[derive(Clone, Debug)]
pub struct PushClient {
    endpoint: String,
    options: SessionOptions,
}

impl PushClient {
    /// Creates a client for an explicit websocket endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end().to_string(),
            options: SessionOptions::default(),
        }
    }

    /// Derives the push endpoint from the tenant's base URL.
    ///
    /// `https://tenant.example` becomes
    /// `wss://tenant.example/api/push/websocket`.
    pub fn for_host(base_url: &str) -> Result<Self, PushError> {
        let base_url = base_url.trim().trim_end_matches('/');
        let (scheme, rest) = base_url
            .split_once("://")
            .ok_or_else(|| PushError::InvalidEndpoint(base_url.to_string()))?;
        let ws_scheme = match scheme {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            _ => return Err(PushError::InvalidEndpoint(base_url.to_string())),
        };
        if rest.is_empty() {
            return Err(PushError::InvalidEndpoint(base_url.to_string()));
        }
        Ok(Self::new(format!("{ws_scheme}://{rest}{PUSH_WEBSOCKET_PATH}")))
    }

    /// Sets how long a group stays open after its latest activity.
    pub fn with_aggregation_window(mut self, window: Duration) -> Self {
        self.options.aggregation_window = window;
        self
    }

    /// Replaces the activity aggregation rules.
    pub fn with_aggregation_rules(mut self, rules: AggregationRules) -> Self {
        self.options.aggregation_rules = rules;
        self
    }

    /// Websocket URL sessions connect to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Opens and authenticates a session, waiting for the outcome.
    ///
    /// Anonymous callers (`None`) get a session without a connection; it
    /// never receives notifications.
    pub async fn init(&self, identity: Option<Identity>) -> Result<PushSession, PushError> {
        let mut session = self.start(identity)?;
        session.ready().await?;
        Ok(session)
    }

    /// Opens a session without waiting for authentication.
    ///
    /// Requests made before the session is ready are queued and sent once it
    /// is. Use [`PushSession::ready`] to learn how authentication went.
    pub fn start(&self, identity: Option<Identity>) -> Result<PushSession, PushError> {
        let Some(identity) = identity else {
            return Ok(PushSession::anonymous());
        };
        let link = connect_websocket(&self.endpoint)?;
        Ok(PushSession::start(link, identity, self.options.clone()))
    }
}

/// Who the socket authenticates as.
#[derive(Clone, Debug)]
pub struct Identity {
    pub user_id: String,
    pub tenant_alias: String,
    signature: SecretString,
}

#[derive(Deserialize)]
struct Profile {
    #[serde(default)]
    anon: bool,
    id: Option<String>,
    tenant: Option<ProfileTenant>,
    signature: Option<String>,
}

#[derive(Deserialize)]
struct ProfileTenant {
    alias: Option<String>,
}

impl Identity {
    /// Identity of a signed-in user.
    pub fn new(
        user_id: impl Into<String>,
        tenant_alias: impl Into<String>,
        signature: SecretString,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_alias: tenant_alias.into(),
            signature,
        }
    }

    /// Reads an identity from the host's profile of the current user,
    /// shaped `{anon, id, tenant: {alias}, signature}`.
    ///
    /// Returns `Ok(None)` for anonymous users.
    pub fn from_profile(profile: &Value) -> Result<Option<Self>, PushError> {
        let profile = Profile::deserialize(profile)?;
        if profile.anon {
            return Ok(None);
        }

        let user_id = profile
            .id
            .ok_or(PushError::InvalidIdentity("id"))?;
        let tenant_alias = profile
            .tenant
            .and_then(|tenant| tenant.alias)
            .ok_or(PushError::InvalidIdentity("tenant.alias"))?;
        let signature = profile
            .signature
            .ok_or(PushError::InvalidIdentity("signature"))?;

        Ok(Some(Self::new(
            user_id,
            tenant_alias,
            SecretString::new(signature),
        )))
    }

    pub(crate) fn authentication_payload(&self) -> AuthenticationPayload {
        AuthenticationPayload {
            user_id: self.user_id.clone(),
            tenant_alias: self.tenant_alias.clone(),
            signature: self.signature.expose_secret().clone(),
        }
    }
}

/// Errors produced by push sessions.
#[derive(Debug, Error)]
pub enum PushError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The channel failed to open or closed before authentication finished.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server refused the socket's credentials.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(Value),

    /// The server refused a request, e.g. a subscription.
    #[error("{name} request rejected: {error}")]
    Rejected { name: String, error: Value },

    /// Requests need an authenticated user.
    #[error("anonymous sessions cannot send requests")]
    Anonymous,

    /// The session stopped before the request could complete.
    #[error("push session is closed")]
    SessionClosed,

    /// The endpoint could not be turned into a websocket URL.
    #[error("invalid push endpoint: {0}")]
    InvalidEndpoint(String),

    /// The host profile lacks a required field.
    #[error("identity is missing `{0}`")]
    InvalidIdentity(&'static str),
}
