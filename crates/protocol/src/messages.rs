//! Wire messages exchanged with the ichibot server.
//!
//! Requests and responses follow JSON-RPC 2.0. Every request carries the
//! caller's credentials, the last known [`GlobalContext`] and the stable
//! client id, merged into the method-specific params object. The server also
//! pushes out-of-band notifications tagged by a `notification` field.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::CredentialProfile;
use crate::error::{ProtocolError, Result};
use crate::version::Version;

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Instrument placeholder meaning "no instrument focused".
pub const ALL_SYM: &str = "*";

/// Text frame the server may send in answer to an application-level ping.
pub const PONG_FRAME: &str = "pong";

/// Human label for an instrument scope (`*` reads as "global").
pub fn scope_label(symbol: Option<&str>) -> &str {
    match symbol {
        None | Some(ALL_SYM) => "global",
        Some(symbol) => symbol,
    }
}

/// Session focus pushed by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalContext {
    #[serde(default)]
    pub current_instrument: Option<String>,
}

impl GlobalContext {
    /// Macro scope for this context: the focused instrument or `*`.
    pub fn scope(&self) -> &str {
        self.current_instrument.as_deref().unwrap_or(ALL_SYM)
    }
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

/// A method of the fixed RPC vocabulary.
pub trait RpcMethod {
    /// Wire name of the method.
    const NAME: &'static str;
    /// Method-specific params, merged with [`CommonArgs`].
    type Params: Serialize;
    /// Decoded `result`.
    type Output: DeserializeOwned;
}

/// Params of methods that take nothing beyond the common arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoParams {}

/// Handshake establishing a server-side session.
pub struct Hello;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloParams {
    pub name: String,
    pub version: Version,
    pub init_lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResult {
    pub instance_started: bool,
    /// `None` when the server sent a version this client cannot read.
    #[serde(default, deserialize_with = "crate::version::deserialize_lenient")]
    pub version: Option<Version>,
}

impl RpcMethod for Hello {
    const NAME: &'static str = "hello";
    type Params = HelloParams;
    type Output = HelloResult;
}

/// Re-evaluates the init script against a live session.
pub struct ReloadInit;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadInitParams {
    pub init_lines: Vec<String>,
}

/// `{ok}` acknowledgement used by several methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default = "ack_default")]
    pub ok: bool,
}

fn ack_default() -> bool {
    true
}

impl RpcMethod for ReloadInit {
    const NAME: &'static str = "reloadInit";
    type Params = ReloadInitParams;
    type Output = Ack;
}

/// Periodic informational liveness call.
pub struct Poke;

impl RpcMethod for Poke {
    const NAME: &'static str = "poke";
    type Params = NoParams;
    type Output = Value;
}

/// Explicit sign-off.
pub struct Bye;

impl RpcMethod for Bye {
    const NAME: &'static str = "bye";
    type Params = NoParams;
    type Output = Ack;
}

/// Command-line completion candidates.
pub struct GetCompletions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionsResult {
    pub completions: (Vec<String>, String),
}

impl RpcMethod for GetCompletions {
    const NAME: &'static str = "getCompletions";
    type Params = NoParams;
    type Output = CompletionsResult;
}

/// Verbatim command passthrough.
pub struct RawCmd;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCmdParams {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCmdResult {
    #[serde(default)]
    pub message: Option<String>,
    pub success: bool,
}

impl RpcMethod for RawCmd {
    const NAME: &'static str = "rawcmd";
    type Params = RawCmdParams;
    type Output = RawCmdResult;
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Fields merged into every request's params.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonArgs<'a> {
    pub auth: &'a CredentialProfile,
    pub context: Option<&'a GlobalContext>,
    pub client_id: &'a str,
}

/// Outgoing JSON-RPC request. Without an `id` it is a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl RpcRequest {
    /// Builds a request for `M`, merging the common arguments into its params.
    pub fn new<M: RpcMethod>(id: Option<u64>, common: &CommonArgs<'_>, params: &M::Params) -> Result<Self> {
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: M::NAME.to_string(),
            params: merge_params(common, params)?,
            id,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn merge_params<P: Serialize>(common: &CommonArgs<'_>, params: &P) -> Result<Value> {
    let mut merged = match serde_json::to_value(params)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(ProtocolError::Serialization(format!(
                "method params must be an object, got {other}"
            )))
        }
    };
    if let Value::Object(common) = serde_json::to_value(common)? {
        merged.extend(common);
    }
    Ok(Value::Object(merged))
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcErrorObject> for ProtocolError {
    fn from(err: RpcErrorObject) -> Self {
        ProtocolError::from_rpc(err.code, err.message)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Severity of a `feed` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedLevel {
    Log,
    Error,
    Warn,
    Dir,
    Debug,
}

/// Log line or key-value dump forwarded from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMessage {
    #[serde(deserialize_with = "one_or_many")]
    pub message: Vec<Value>,
    #[serde(rename = "type")]
    pub level: FeedLevel,
}

fn one_or_many<'de, D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        single => vec![single],
    })
}

impl FeedMessage {
    /// Joins the message parts; strings verbatim, everything else as JSON.
    pub fn text(&self) -> String {
        self.message
            .iter()
            .map(|part| match part {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `key: value` pairs of the first part, used by `dir` feeds.
    pub fn dir_entries(&self) -> Vec<(String, String)> {
        match self.message.first() {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect(),
            Some(other) => vec![(String::new(), other.to_string())],
            None => Vec::new(),
        }
    }
}

/// Server-side instruction to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "instruction", rename_all = "kebab-case")]
pub enum Instruction {
    /// The server ended the session; the user has to log in again.
    ForceDisconnect {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Unsolicited message pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Feed(FeedMessage),
    Context(GlobalContext),
    Instruction(Instruction),
}

impl Notification {
    /// Decodes a notification from its name and params.
    ///
    /// Anything outside the fixed vocabulary is a protocol violation.
    pub fn from_parts(name: &str, params: Value) -> Result<Self> {
        let violation = |err: serde_json::Error| {
            ProtocolError::ProtocolViolation(format!("malformed '{name}' notification: {err}"))
        };
        match name {
            "feed" => serde_json::from_value(params).map(Notification::Feed).map_err(violation),
            "context" => serde_json::from_value(params)
                .map(Notification::Context)
                .map_err(violation),
            "instruction" => serde_json::from_value(params)
                .map(Notification::Instruction)
                .map_err(|err| ProtocolError::UnknownInstruction(err.to_string())),
            other => Err(ProtocolError::ProtocolViolation(format!(
                "unknown notification '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// A decoded text frame from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to the request with this id.
    Response {
        id: u64,
        outcome: std::result::Result<Value, RpcErrorObject>,
    },
    /// Server push.
    Notification(Notification),
    /// Application-level pong; only refreshes liveness.
    Pong,
}

impl Inbound {
    /// Classifies a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim() == PONG_FRAME {
            return Ok(Inbound::Pong);
        }

        let mut frame: Map<String, Value> = serde_json::from_str(text)?;

        if let Some(name) = frame.remove("notification") {
            let name = name
                .as_str()
                .ok_or_else(|| ProtocolError::ProtocolViolation("notification name is not a string".into()))?
                .to_string();
            let params = frame.remove("params").unwrap_or(Value::Null);
            return Notification::from_parts(&name, params).map(Inbound::Notification);
        }

        let Some(id) = frame.get("id").and_then(response_id) else {
            return Err(ProtocolError::ProtocolViolation(format!(
                "frame is neither a response nor a notification: {text}"
            )));
        };

        if let Some(error) = frame.remove("error") {
            let error: RpcErrorObject = serde_json::from_value(error)?;
            return Ok(Inbound::Response { id, outcome: Err(error) });
        }

        let result = frame.remove("result").unwrap_or(Value::Null);
        Ok(Inbound::Response { id, outcome: Ok(result) })
    }
}

fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
