use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation id carried by a request frame and echoed by its acknowledgement.
pub type RequestId = u64;

/// Request name used to authenticate the socket.
pub const AUTHENTICATION: &str = "authentication";
/// Request name used to subscribe to a channel stream.
pub const SUBSCRIBE: &str = "subscribe";
/// `objectType` tag of an entity that folds several entities together.
pub const COLLECTION_OBJECT_TYPE: &str = "collection";

const ACTIVITY_TYPE_FIELD: &str = "oae:activityType";
const PUBLISHED_FIELD: &str = "published";
const ENTITY_ID_FIELD: &str = "oae:id";
const OBJECT_TYPE_FIELD: &str = "objectType";
pub(crate) const COLLECTION_FIELD: &str = "oae:collection";

/// Outbound request frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub id: RequestId,
    pub name: String,
    pub payload: Value,
}

/// Payload of the `authentication` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationPayload {
    pub user_id: String,
    pub tenant_alias: String,
    pub signature: String,
}

/// Stream reference as the server names it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamRefMsg {
    pub resource_id: String,
    pub activity_stream_id: String,
}

/// Payload of the `subscribe` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribePayload {
    pub stream: StreamRefMsg,
    pub token: String,
}

/// Server acknowledgement of a request frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckFrame {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Server-pushed activity for a channel stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFrame {
    pub resource_id: String,
    pub stream_type: String,
    pub activity: Activity,
}

impl NotificationFrame {
    /// Subscription key the notification is routed by.
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.resource_id.clone(), self.stream_type.clone())
    }
}

/// Every inbound frame, classified once when it is decoded.
///
/// A frame carrying `resourceId` and `streamType` is a notification; anything
/// else must be an acknowledgement with an `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InboundFrame {
    Notification(NotificationFrame),
    Acknowledgement(AckFrame),
}

/// Subscription key: a channel plus a stream type within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub resource_id: String,
    pub stream_type: String,
}

impl StreamKey {
    /// Key for `stream_type` on channel `resource_id`.
    pub fn new(resource_id: impl Into<String>, stream_type: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            stream_type: stream_type.into(),
        }
    }

    /// Wire form used in the subscribe payload.
    pub fn to_msg(&self) -> StreamRefMsg {
        StreamRefMsg {
            resource_id: self.resource_id.clone(),
            activity_stream_id: self.stream_type.clone(),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.stream_type)
    }
}

/// Role an entity plays within an activity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityRole {
    Actor,
    Object,
    Target,
}

impl EntityRole {
    /// All roles in the order they are considered for aggregation.
    pub const ALL: [EntityRole; 3] = [EntityRole::Actor, EntityRole::Object, EntityRole::Target];

    /// Activity field that holds this role's entity.
    pub fn field(self) -> &'static str {
        match self {
            Self::Actor => "actor",
            Self::Object => "object",
            Self::Target => "target",
        }
    }
}

/// Activity payload of a notification, kept exactly as the server sent it.
///
/// Only a few fields drive aggregation. They are read through accessors, so
/// an activity of unexpected shape still routes; it just never aggregates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Activity {
    fields: Map<String, Value>,
}

impl Activity {
    /// The `oae:activityType` tag, when it is a string.
    pub fn activity_type(&self) -> Option<&str> {
        self.fields.get(ACTIVITY_TYPE_FIELD)?.as_str()
    }

    /// The `published` timestamp in whatever form the server used.
    pub fn published(&self) -> Option<&Value> {
        self.fields.get(PUBLISHED_FIELD)
    }

    /// Entity playing `role`; JSON `null` counts as absent.
    pub fn entity(&self, role: EntityRole) -> Option<&Value> {
        self.fields.get(role.field()).filter(|entity| !entity.is_null())
    }

    /// `oae:id` of the entity playing `role`, when it is a string.
    pub fn entity_id(&self, role: EntityRole) -> Option<&str> {
        self.entity(role)?.get(ENTITY_ID_FIELD)?.as_str()
    }

    /// Any top-level field of the activity.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// The whole activity object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub(crate) fn entity_mut(&mut self, role: EntityRole) -> Option<&mut Value> {
        self.fields
            .get_mut(role.field())
            .filter(|entity| !entity.is_null())
    }

    pub(crate) fn take_entity(&mut self, role: EntityRole) -> Option<Value> {
        self.fields
            .remove(role.field())
            .filter(|entity| !entity.is_null())
    }

    pub(crate) fn set_entity(&mut self, role: EntityRole, entity: Value) {
        self.fields.insert(role.field().to_string(), entity);
    }

    pub(crate) fn take_published(&mut self) -> Option<Value> {
        self.fields.remove(PUBLISHED_FIELD)
    }

    /// Replaces the timestamp; `None` removes it.
    pub(crate) fn set_published(&mut self, published: Option<Value>) {
        match published {
            Some(published) => {
                self.fields.insert(PUBLISHED_FIELD.to_string(), published);
            }
            None => {
                self.fields.remove(PUBLISHED_FIELD);
            }
        }
    }
}

/// Whether `entity` already folds several entities together.
pub fn is_collection(entity: &Value) -> bool {
    entity.get(COLLECTION_FIELD).is_some_and(Value::is_array)
}

/// Wraps `items` in a collection entity.
pub fn collection_of(items: Vec<Value>) -> Value {
    let mut entity = Map::new();
    entity.insert(
        OBJECT_TYPE_FIELD.to_string(),
        Value::String(COLLECTION_OBJECT_TYPE.to_string()),
    );
    entity.insert(COLLECTION_FIELD.to_string(), Value::Array(items));
    Value::Object(entity)
}

impl RequestFrame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl InboundFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
