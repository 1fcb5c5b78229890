//! `homewire-types` – shared vocabulary of the hub.
//!
//! Holds the workspace error type, the [`DeviceClass`] tag, the inbound
//! [`Envelope`] tagged union and the outbound frames the hub writes back to
//! peers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Token handed out in reply to every `auth` envelope.
///
/// It grants nothing: `connect` never checks it.  Kept configurable so a
/// deployment can at least change the value clients see.
pub const DEFAULT_AUTH_TOKEN: &str = "12345678";

/// `wsid` stamped on hub-generated liveness notifications.
pub const LIVENESS_WSID: &str = "1234567890";

/// Class name that marks an aggregator/controller peer.
pub const REST_CLASS: &str = "rest";

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Malformed JSON, or a known envelope with a missing or mistyped field.
    #[error("Envelope Decode Error: {0}")]
    Decode(String),

    #[error("Envelope Encode Error: {0}")]
    Encode(String),

    /// The child process could not be started.
    #[error("Launch Failed for {command}: {details}")]
    Launch { command: String, details: String },

    /// Listener, accept or websocket handshake failure.
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    /// The request path does not map onto a script under the script directory.
    #[error("Script Not Found: {0}")]
    ScriptNotFound(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Device class
// ────────────────────────────────────────────────────────────────────────────

/// The `c_type` tag a peer declares when it binds.
///
/// `"rest"` peers aggregate: they see every device's liveness and receive
/// unrouted notifications.  Anything else is a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceClass {
    Rest,
    Device(String),
}

impl DeviceClass {
    pub fn is_rest(&self) -> bool {
        matches!(self, DeviceClass::Rest)
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeviceClass::Rest => REST_CLASS,
            DeviceClass::Device(name) => name,
        }
    }
}

impl From<String> for DeviceClass {
    fn from(value: String) -> Self {
        if value == REST_CLASS {
            DeviceClass::Rest
        } else {
            DeviceClass::Device(value)
        }
    }
}

impl From<&str> for DeviceClass {
    fn from(value: &str) -> Self {
        DeviceClass::from(value.to_string())
    }
}

impl From<DeviceClass> for String {
    fn from(value: DeviceClass) -> Self {
        match value {
            DeviceClass::Rest => REST_CLASS.to_string(),
            DeviceClass::Device(name) => name,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inbound envelopes
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthRequest {
    pub mac: String,
    pub sn: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectRequest {
    pub sn: String,
    pub token: String,
    pub c_type: DeviceClass,
}

/// A controller asking the hub to forward `data` to the device bound as `sn`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RestRequest {
    pub sn: String,
    pub wsid: String,
    pub data: Map<String, Value>,
}

/// A device answering the controller bound as `from`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouteRequest {
    pub wsid: String,
    pub from: String,
    pub data: RouteData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationRequest {
    pub from: String,
}

/// Payload of a route envelope.  Lists stay lists and maps stay maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteData {
    List(Vec<Value>),
    Map(Map<String, Value>),
}

/// Which of the three interchangeable route tags a message arrived with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Router,
    Tv,
    Cond,
}

impl RouteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteKind::Router => "router",
            RouteKind::Tv => "tv",
            RouteKind::Cond => "cond",
        }
    }
}

/// One decoded inbound message, keyed by its `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Auth(AuthRequest),
    Connect(ConnectRequest),
    Rest(RestRequest),
    Route(RouteKind, RouteRequest),
    Notification(NotificationRequest),
}

impl Envelope {
    /// Decode one text frame.
    ///
    /// Returns `Ok(None)` for a well-formed object whose `type` is not one the
    /// hub understands; such frames are dropped without a reply.
    ///
    /// # Errors
    ///
    /// [`HubError::Decode`] for malformed JSON, a missing or non-string
    /// `type`, or a known type with missing/mistyped fields.
    pub fn decode(text: &str) -> Result<Option<Envelope>, HubError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| HubError::Decode(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| HubError::Decode("missing string field `type`".to_string()))?;

        let envelope = match kind.as_str() {
            "auth" => Envelope::Auth(fields(&kind, value)?),
            "connect" => Envelope::Connect(fields(&kind, value)?),
            "rest" => Envelope::Rest(fields(&kind, value)?),
            "router" => Envelope::Route(RouteKind::Router, fields(&kind, value)?),
            "tv" => Envelope::Route(RouteKind::Tv, fields(&kind, value)?),
            "cond" => Envelope::Route(RouteKind::Cond, fields(&kind, value)?),
            "notification" => Envelope::Notification(fields(&kind, value)?),
            _ => return Ok(None),
        };
        Ok(Some(envelope))
    }

    /// The wire tag this envelope was decoded from.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Auth(_) => "auth",
            Envelope::Connect(_) => "connect",
            Envelope::Rest(_) => "rest",
            Envelope::Route(kind, _) => kind.as_str(),
            Envelope::Notification(_) => "notification",
        }
    }
}

fn fields<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, HubError> {
    serde_json::from_value(value).map_err(|e| HubError::Decode(format!("`{kind}` envelope: {e}")))
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound frames
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AuthReply<'a> {
    pub token: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectReply {
    pub message: &'static str,
}

impl Default for ConnectReply {
    fn default() -> Self {
        Self {
            message: "connected",
        }
    }
}

/// `rest` envelope re-shaped for the target device.
#[derive(Debug, Clone, Serialize)]
pub struct RestForward<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub wsid: &'a str,
    pub from: &'a str,
    pub data: &'a Map<String, Value>,
}

impl<'a> RestForward<'a> {
    pub fn new(wsid: &'a str, from: &'a str, data: &'a Map<String, Value>) -> Self {
        Self {
            kind: "rest",
            wsid,
            from,
            data,
        }
    }
}

/// Route envelope re-shaped for the controller it answers.
#[derive(Debug, Clone, Serialize)]
pub struct RouteForward<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub wsid: &'a str,
    pub data: &'a RouteData,
}

impl<'a> RouteForward<'a> {
    pub fn new(wsid: &'a str, data: &'a RouteData) -> Self {
        Self {
            kind: "rest",
            wsid,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceState<'a> {
    pub msgtype: &'static str,
    pub devicetype: &'a str,
    pub state: Liveness,
}

/// Hub-generated notification telling controllers a device came or went.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessNotification<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub wsid: &'static str,
    pub from: &'a str,
    pub data: DeviceState<'a>,
}

impl<'a> LivenessNotification<'a> {
    pub fn new(serial: &'a str, class: &'a DeviceClass, state: Liveness) -> Self {
        Self {
            kind: "notification",
            wsid: LIVENESS_WSID,
            from: serial,
            data: DeviceState {
                msgtype: "devicestate",
                devicetype: class.as_str(),
                state,
            },
        }
    }
}

/// Serialise an outbound frame to its text form.
///
/// # Errors
///
/// Returns [`HubError::Encode`] if serialisation fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, HubError> {
    serde_json::to_string(frame).map_err(|e| HubError::Encode(e.to_string()))
}
