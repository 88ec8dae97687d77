use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type JsonMap = BTreeMap<String, Value>;

/// Event type fired by the control plane whenever an entity's state changes.
pub const EVENT_STATE_CHANGED: &str = "state_changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    #[default]
    Local,
    Remote,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Local => "local",
            EventOrigin::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(EventOrigin::Local),
            "remote" => Some(EventOrigin::Remote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default = "new_context_id")]
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: new_context_id(),
            user_id: None,
            parent_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// A control-plane event as it travels on the bus.
///
/// `data` is expected to be a JSON object (or null); anything else is
/// rejected by the recorder when the row is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub origin: EventOrigin,
    #[serde(default = "now")]
    pub time_fired: DateTime<Utc>,
    #[serde(default)]
    pub context: Context,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            origin: EventOrigin::Local,
            time_fired: Utc::now(),
            context: Context::new(),
        }
    }

    /// Builds a `state_changed` event. The firing time and context follow the
    /// new state when there is one.
    pub fn state_changed(
        entity_id: impl Into<String>,
        old_state: Option<State>,
        new_state: Option<State>,
    ) -> Self {
        let entity_id = entity_id.into();
        let time_fired = new_state
            .as_ref()
            .map(|s| s.last_updated)
            .unwrap_or_else(Utc::now);
        let context = new_state
            .as_ref()
            .map(|s| s.context.clone())
            .unwrap_or_default();
        let data = StateChangedData {
            entity_id,
            old_state,
            new_state,
        };
        Self {
            event_type: EVENT_STATE_CHANGED.to_string(),
            data: serde_json::to_value(&data).unwrap_or(Value::Null),
            origin: EventOrigin::Local,
            time_fired,
            context,
        }
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_time_fired(mut self, time_fired: DateTime<Utc>) -> Self {
        self.time_fired = time_fired;
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn is_state_changed(&self) -> bool {
        self.event_type == EVENT_STATE_CHANGED
    }

    /// The entity a `state_changed` event refers to, if any.
    pub fn entity_id(&self) -> Option<&str> {
        if !self.is_state_changed() {
            return None;
        }
        self.data.get("entity_id").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: JsonMap,
    #[serde(default = "now")]
    pub last_changed: DateTime<Utc>,
    #[serde(default = "now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub context: Context,
}

impl State {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        let ts = Utc::now();
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: JsonMap::new(),
            last_changed: ts,
            last_updated: ts,
            context: Context::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: JsonMap) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets both `last_changed` and `last_updated`.
    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.last_changed = ts;
        self.last_updated = ts;
        self
    }

    pub fn with_last_changed(mut self, ts: DateTime<Utc>) -> Self {
        self.last_changed = ts;
        self
    }

    pub fn domain(&self) -> &str {
        split_entity_id(&self.entity_id)
            .map(|(domain, _)| domain)
            .unwrap_or_default()
    }
}

/// Payload of a `state_changed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedData {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<State>,
    #[serde(default)]
    pub new_state: Option<State>,
}

impl StateChangedData {
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        serde_json::from_value(event.data.clone())
    }
}

/// Splits `domain.object_id`. Returns `None` when there is no dot.
pub fn split_entity_id(entity_id: &str) -> Option<(&str, &str)> {
    entity_id.split_once('.')
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn new_context_id() -> String {
    ulid::Ulid::new().to_string()
}
