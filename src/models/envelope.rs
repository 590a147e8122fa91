//! Terminal <-> server message envelope.
//!
//! Every message on the wire is a JSON object carrying exactly one of the
//! `cmd` (request) or `ret` (reply) tags. The envelope keeps the full object
//! so queued messages round-trip field-for-field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

use crate::error::AppError;

pub const CMD_FIELD: &str = "cmd";
pub const RET_FIELD: &str = "ret";
pub const SN_FIELD: &str = "sn";

/// Which tag an envelope carries, with its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    Command(String),
    Reply(String),
}

impl EnvelopeKind {
    pub fn name(&self) -> &str {
        match self {
            EnvelopeKind::Command(name) | EnvelopeKind::Reply(name) => name,
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeKind::Command(name) => write!(f, "cmd:{}", name),
            EnvelopeKind::Reply(name) => write!(f, "ret:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, JsonValue>", into = "Map<String, JsonValue>")]
pub struct Envelope {
    kind: EnvelopeKind,
    fields: Map<String, JsonValue>,
}

impl Envelope {
    /// Parses raw wire text, rejecting anything that is not a tagged JSON object.
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let value: JsonValue = serde_json::from_str(text)
            .map_err(|e| AppError::MalformedMessage(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: JsonValue) -> Result<Self, AppError> {
        match value {
            JsonValue::Object(fields) => Self::try_from(fields),
            other => Err(AppError::MalformedMessage(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Builds a reply carrying `ret` plus the given body fields.
    pub fn reply(ret: &str, body: Map<String, JsonValue>) -> Self {
        let mut fields = body;
        fields.remove(CMD_FIELD);
        fields.insert(RET_FIELD.to_string(), JsonValue::String(ret.to_string()));
        Self {
            kind: EnvelopeKind::Reply(ret.to_string()),
            fields,
        }
    }

    pub fn kind(&self) -> &EnvelopeKind {
        &self.kind
    }

    pub fn is_command(&self, name: &str) -> bool {
        matches!(&self.kind, EnvelopeKind::Command(cmd) if cmd == name)
    }

    /// Device serial number, when the message carries one
    pub fn device_sn(&self) -> Option<&str> {
        self.fields
            .get(SN_FIELD)
            .and_then(|v| v.as_str())
            .filter(|sn| !sn.is_empty())
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    pub fn to_value(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }

    pub fn to_json_string(&self) -> String {
        JsonValue::Object(self.fields.clone()).to_string()
    }

    /// Deserializes the full object into a typed request or reply body.
    pub fn decode<T>(&self) -> Result<T, AppError>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(self.to_value())
            .map_err(|e| AppError::MalformedMessage(format!("{} body: {}", self.kind, e)))
    }
}

impl TryFrom<Map<String, JsonValue>> for Envelope {
    type Error = AppError;

    fn try_from(fields: Map<String, JsonValue>) -> Result<Self, Self::Error> {
        let kind = match (fields.get(CMD_FIELD), fields.get(RET_FIELD)) {
            (Some(_), Some(_)) => {
                return Err(AppError::MalformedMessage(
                    "envelope carries both cmd and ret".to_string(),
                ))
            }
            (None, None) => {
                return Err(AppError::MalformedMessage(
                    "envelope carries neither cmd nor ret".to_string(),
                ))
            }
            (Some(cmd), None) => EnvelopeKind::Command(tag_value(CMD_FIELD, cmd)?),
            (None, Some(ret)) => EnvelopeKind::Reply(tag_value(RET_FIELD, ret)?),
        };

        Ok(Self { kind, fields })
    }
}

impl From<Envelope> for Map<String, JsonValue> {
    fn from(envelope: Envelope) -> Self {
        envelope.fields
    }
}

fn tag_value(field: &str, value: &JsonValue) -> Result<String, AppError> {
    match value.as_str() {
        Some(tag) if !tag.is_empty() => Ok(tag.to_string()),
        _ => Err(AppError::MalformedMessage(format!(
            "{} must be a non-empty string",
            field
        ))),
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_envelope() {
        let envelope = Envelope::parse(r#"{"cmd":"reg","sn":"SN1","devinfo":{}}"#).unwrap();
        assert_eq!(envelope.kind(), &EnvelopeKind::Command("reg".to_string()));
        assert_eq!(envelope.device_sn(), Some("SN1"));
        assert!(envelope.is_command("reg"));
    }

    #[test]
    fn test_reply_envelope() {
        let envelope = Envelope::parse(r#"{"ret":"getuserlist","result":true}"#).unwrap();
        assert_eq!(envelope.kind(), &EnvelopeKind::Reply("getuserlist".to_string()));
        assert_eq!(envelope.device_sn(), None);
    }

    #[test]
    fn test_untagged_object_is_malformed() {
        let err = Envelope::parse(r#"{"foo":"bar"}"#).unwrap_err();
        assert!(matches!(err, AppError::MalformedMessage(_)));
    }

    #[test]
    fn test_doubly_tagged_object_is_malformed() {
        let err = Envelope::parse(r#"{"cmd":"reg","ret":"reg"}"#).unwrap_err();
        assert!(matches!(err, AppError::MalformedMessage(_)));
    }

    #[test]
    fn test_non_object_and_bad_tag_are_malformed() {
        assert!(Envelope::parse("[1,2]").is_err());
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse(r#"{"cmd":7}"#).is_err());
        assert!(Envelope::parse(r#"{"cmd":""}"#).is_err());
    }

    #[test]
    fn test_serde_preserves_every_field() {
        let original = json!({
            "cmd": "setuserinfo",
            "sn": "SN1",
            "enrollid": 12,
            "record": [{"a": 1}, {"b": null}]
        });
        let envelope: Envelope = serde_json::from_value(original.clone()).unwrap();
        let text = serde_json::to_string(&envelope).unwrap();
        let back: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_deserialize_rejects_untagged() {
        let result: Result<Envelope, _> = serde_json::from_value(json!({"foo": "bar"}));
        assert!(result.is_err());
    }
}
