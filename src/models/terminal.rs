use chrono::Local;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::AppError;
use crate::models::envelope::{Envelope, EnvelopeKind};

pub const CMD_REG: &str = "reg";
pub const CMD_SENDLOG: &str = "sendlog";
pub const CMD_REBOOT: &str = "reboot";

/// Terminal wall-clock format used in `cloudtime`
pub const CLOUD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Device description sent with `reg`. Only the fields we log are typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevInfo {
    #[serde(default)]
    pub modelname: Option<String>,
    #[serde(default)]
    pub netinuse: Option<i64>,
    #[serde(default)]
    pub fpalgo: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterRequest {
    pub sn: String,
    #[serde(default)]
    pub devinfo: DevInfo,
}

/// One access event uploaded by `sendlog`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub enrollid: i64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub aliasid: Option<String>,
    #[serde(default)]
    pub name: String,
    pub time: String,
    #[serde(default)]
    pub mode: i64,
    #[serde(default)]
    pub inout: i64,
    #[serde(default)]
    pub event: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendLogRequest {
    pub sn: String,
    pub count: usize,
    #[serde(default)]
    pub logindex: i64,
    #[serde(default)]
    pub record: Vec<LogRecord>,
}

impl SendLogRequest {
    /// The records actually announced by `count`, or None when the terminal sent fewer.
    pub fn announced_records(&self) -> Option<&[LogRecord]> {
        self.record.get(..self.count)
    }
}

/// Terminal-initiated requests the server answers in-line
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalRequest {
    Register(RegisterRequest),
    SendLog(SendLogRequest),
    Unsupported(String),
}

impl TerminalRequest {
    /// Interprets a `cmd` envelope. Replies are not requests and are rejected.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, AppError> {
        match envelope.kind() {
            EnvelopeKind::Command(cmd) => match cmd.as_str() {
                CMD_REG => Ok(TerminalRequest::Register(envelope.decode()?)),
                CMD_SENDLOG => Ok(TerminalRequest::SendLog(envelope.decode()?)),
                other => Ok(TerminalRequest::Unsupported(other.to_string())),
            },
            EnvelopeKind::Reply(ret) => Err(AppError::Internal(format!(
                "ret:{} is not a terminal request",
                ret
            ))),
        }
    }
}

pub fn cloud_time_now() -> String {
    Local::now().format(CLOUD_TIME_FORMAT).to_string()
}

fn body<const N: usize>(pairs: [(&str, JsonValue); N]) -> serde_json::Map<String, JsonValue> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

pub fn register_success(cloudtime: &str) -> Envelope {
    Envelope::reply(
        CMD_REG,
        body([
            ("result", json!(true)),
            ("cloudtime", json!(cloudtime)),
            ("nosenduser", json!(true)),
        ]),
    )
}

pub fn sendlog_success(count: usize, logindex: i64, cloudtime: &str) -> Envelope {
    Envelope::reply(
        CMD_SENDLOG,
        body([
            ("result", json!(true)),
            ("count", json!(count)),
            ("logindex", json!(logindex)),
            ("cloudtime", json!(cloudtime)),
            ("access", json!(1)),
        ]),
    )
}

pub fn sendlog_failure() -> Envelope {
    Envelope::reply(
        CMD_SENDLOG,
        body([("result", json!(false)), ("reason", json!("1"))]),
    )
}

/// Body returned to a dispatch caller when the command gets no terminal answer by design
pub fn no_response_expected() -> JsonValue {
    json!({ "status": "No response." })
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}
