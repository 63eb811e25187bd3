use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Generic runtime value carried in record payloads and configuration maps.
///
/// Supports all JSON-compatible types plus binary data. Deserializes from
/// plain JSON (untagged), so descriptor files and remote call arguments can
/// use ordinary JSON literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON integer (signed 64-bit).
    Int(i64),
    /// JSON floating-point (64-bit IEEE 754).
    Float(f64),
    /// JSON string (UTF-8).
    String(String),
    /// JSON array (ordered sequence of values).
    Array(Vec<Value>),
    /// JSON object. Uses `BTreeMap` for deterministic serialization order.
    Map(BTreeMap<String, Value>),
    /// Binary data (not directly representable in JSON).
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns the integer if this is an `Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string slice if this is a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Looks up a field if this is a `Map`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Opaque key/value configuration of a service.
pub type ConfigMap = BTreeMap<String, Value>;

/// Declared record type of a channel endpoint (e.g. `"Rec13"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// A single record flowing through a channel: the type tag fixed at wiring
/// time plus the opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub type_tag: TypeTag,
    pub payload: Value,
}

impl Record {
    #[must_use]
    pub fn new(type_tag: TypeTag, payload: impl Into<Value>) -> Self {
        Self {
            type_tag,
            payload: payload.into(),
        }
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

string_id!(
    /// Identity of a registered artifact. Never reused once removed.
    ArtifactId
);

string_id!(
    /// Identity of a service instance, unique across all artifacts.
    ServiceId
);

impl ServiceId {
    /// Builds the runtime identity of a declared service inside an artifact.
    #[must_use]
    pub fn scoped(artifact: &ArtifactId, declared: &str) -> Self {
        Self(format!("{artifact}/{declared}"))
    }
}

/// Role of a service in a pipeline; determines which port directions it may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceKind {
    /// Produces records only (no inputs).
    Source,
    /// Consumes and produces records.
    Transform,
    /// Consumes records only (no outputs).
    Sink,
}

impl ServiceKind {
    #[must_use]
    pub fn accepts_inputs(self) -> bool {
        !matches!(self, ServiceKind::Source)
    }

    #[must_use]
    pub fn accepts_outputs(self) -> bool {
        !matches!(self, ServiceKind::Sink)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceKind::Source => "SOURCE",
            ServiceKind::Transform => "TRANSFORM",
            ServiceKind::Sink => "SINK",
        })
    }
}

/// Identity of a record channel: `producer.output -> consumer.input`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    pub producer: ServiceId,
    pub output: String,
    pub consumer: ServiceId,
    pub input: String,
}

impl ChannelId {
    #[must_use]
    pub fn touches(&self, service: &ServiceId) -> bool {
        &self.producer == service || &self.consumer == service
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}->{}.{}",
            self.producer, self.output, self.consumer, self.input
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_from_json_preserves_structure() {
        let json = serde_json::json!({"seq": 3, "ratio": 0.5, "tags": ["a"], "ok": true, "none": null});
        let value = Value::from(json);

        assert_eq!(value.get("seq"), Some(&Value::Int(3)));
        assert_eq!(value.get("ratio"), Some(&Value::Float(0.5)));
        assert_eq!(
            value.get("tags"),
            Some(&Value::Array(vec![Value::String("a".into())]))
        );
        assert_eq!(value.get("ok"), Some(&Value::Bool(true)));
        assert_eq!(value.get("none"), Some(&Value::Null));
    }

    #[test]
    fn value_deserializes_from_plain_json() {
        let config: ConfigMap = serde_json::from_str(r#"{"step": 2, "label": "x"}"#).unwrap();
        assert_eq!(config["step"], Value::Int(2));
        assert_eq!(config["label"].as_str(), Some("x"));
    }

    #[test]
    fn scoped_service_id_includes_artifact() {
        let artifact = ArtifactId::new("a1");
        assert_eq!(ServiceId::scoped(&artifact, "s1").as_str(), "a1/s1");
    }

    #[test]
    fn channel_id_display_and_touches() {
        let id = ChannelId {
            producer: ServiceId::new("p"),
            output: "out".into(),
            consumer: ServiceId::new("c"),
            input: "in".into(),
        };
        assert_eq!(id.to_string(), "p.out->c.in");
        assert!(id.touches(&ServiceId::new("p")));
        assert!(id.touches(&ServiceId::new("c")));
        assert!(!id.touches(&ServiceId::new("x")));
    }

    #[test]
    fn kind_port_directions() {
        assert!(!ServiceKind::Source.accepts_inputs());
        assert!(ServiceKind::Source.accepts_outputs());
        assert!(ServiceKind::Transform.accepts_inputs());
        assert!(!ServiceKind::Sink.accepts_outputs());
    }

    #[test]
    fn kind_serializes_screaming_case() {
        let json = serde_json::to_string(&ServiceKind::Transform).unwrap();
        assert_eq!(json, "\"TRANSFORM\"");
    }
}
