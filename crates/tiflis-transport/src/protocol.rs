//! Wire protocol shared by the relay, workstations and clients.
//!
//! Every frame is a JSON envelope `{type, id?, payload}`. Relay-level
//! types are decoded once into [`RelayRequest`]; everything else is opaque
//! to the relay and forwarded.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const REGISTER: &str = "workstation.register";
pub const REGISTERED: &str = "workstation.registered";
pub const CONNECT: &str = "connect";
pub const CONNECTED: &str = "connected";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const FORWARD_TO_DEVICE: &str = "forward.to_device";
pub const ERROR: &str = "error";
pub const WORKSTATION_OFFLINE: &str = "connection.workstation_offline";
pub const WORKSTATION_ONLINE: &str = "connection.workstation_online";
pub const CLIENT_DISCONNECTED: &str = "client.disconnected";

pub const MIN_API_KEY_LEN: usize = 32;
pub const MIN_AUTH_KEY_LEN: usize = 16;
const MAX_ID_LEN: usize = 64;

/// JSON envelope carried in every WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            payload,
        }
    }

    /// Envelope carrying a typed payload.
    ///
    /// # Errors
    /// Returns error if the payload does not serialize to JSON.
    pub fn from_payload<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    #[must_use]
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    /// Build an `error` envelope answering the request `id`.
    #[must_use]
    pub fn error(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            ERROR,
            json!({ "code": code, "message": message.into() }),
        )
        .with_id(id)
    }

    /// Wrap `message` for delivery to a single device.
    #[must_use]
    pub fn to_device(device_id: &str, message: &Self) -> Self {
        Self::new(
            FORWARD_TO_DEVICE,
            json!({ "device_id": device_id, "message": message }),
        )
    }

    /// String field of the payload, if present.
    #[must_use]
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Set a field on the payload, turning a missing payload into an object.
    pub fn set_payload_field(&mut self, field: &str, value: Value) {
        if !self.payload.is_object() {
            self.payload = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.payload {
            map.insert(field.to_string(), value);
        }
    }
}

/// Error codes surfaced to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidApiKey,
    InvalidAuthKey,
    TunnelNotFound,
    WorkstationOffline,
    RegistrationFailed,
    InvalidPayload,
    InternalError,
}

/// Payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Relay failure, surfaced to the peer as an [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid auth key")]
    InvalidAuthKey,
    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),
    #[error("Workstation is offline: {0}")]
    WorkstationOffline(String),
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Internal error")]
    Internal,
}

impl RelayError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidAuthKey => ErrorCode::InvalidAuthKey,
            Self::TunnelNotFound(_) => ErrorCode::TunnelNotFound,
            Self::WorkstationOffline(_) => ErrorCode::WorkstationOffline,
            Self::RegistrationFailed(_) => ErrorCode::RegistrationFailed,
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::Internal => ErrorCode::InternalError,
        }
    }

    /// Error envelope answering the request `id`.
    #[must_use]
    pub fn to_envelope(&self, id: Option<String>) -> Envelope {
        Envelope::error(id, self.code(), self.to_string())
    }
}

/// `workstation.register` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub api_key: String,
    pub name: String,
    pub auth_key: String,
    #[serde(default)]
    pub reconnect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_tunnel_id: Option<String>,
}

impl RegisterPayload {
    /// Check field syntax.
    ///
    /// # Errors
    /// Returns `InvalidPayload` naming the first malformed field.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.api_key.len() < MIN_API_KEY_LEN {
            return Err(RelayError::InvalidPayload(format!(
                "api_key must be at least {MIN_API_KEY_LEN} characters"
            )));
        }
        if self.name.trim().is_empty() {
            return Err(RelayError::InvalidPayload("name must not be empty".into()));
        }
        validate_auth_key(&self.auth_key)
    }
}

/// `connect` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectPayload {
    pub tunnel_id: String,
    pub auth_key: String,
    pub device_id: String,
    #[serde(default)]
    pub reconnect: bool,
}

impl ConnectPayload {
    /// Check field syntax.
    ///
    /// # Errors
    /// Returns `InvalidPayload` naming the first malformed field.
    pub fn validate(&self) -> Result<(), RelayError> {
        if !is_valid_id(&self.tunnel_id) {
            return Err(RelayError::InvalidPayload("malformed tunnel_id".into()));
        }
        validate_auth_key(&self.auth_key)?;
        if !is_valid_id(&self.device_id) {
            return Err(RelayError::InvalidPayload("malformed device_id".into()));
        }
        Ok(())
    }
}

/// `workstation.registered` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default)]
    pub restored: bool,
}

/// `connected` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub tunnel_id: String,
    pub workstation_name: String,
    pub workstation_online: bool,
    #[serde(default)]
    pub restored: bool,
}

/// `forward.to_device` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardToDevice {
    pub device_id: String,
    pub message: Envelope,
}

fn validate_auth_key(auth_key: &str) -> Result<(), RelayError> {
    if auth_key.len() < MIN_AUTH_KEY_LEN {
        return Err(RelayError::InvalidPayload(format!(
            "auth_key must be at least {MIN_AUTH_KEY_LEN} characters"
        )));
    }
    Ok(())
}

/// Tunnel and device ids: 1 to 64 characters of `[A-Za-z0-9_-]`.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A decoded inbound frame, as seen by the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayRequest {
    Register(RegisterPayload),
    Connect(ConnectPayload),
    Ping { timestamp: Option<Value> },
    Pong,
    /// Anything else is routed to the other side untouched.
    Forward(Envelope),
}

impl RelayRequest {
    /// Decode an envelope.
    ///
    /// # Errors
    /// Returns `InvalidPayload` when a relay-level payload does not match
    /// its schema or fails validation.
    pub fn decode(envelope: Envelope) -> Result<Self, RelayError> {
        fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RelayError> {
            serde_json::from_value(value).map_err(|e| RelayError::InvalidPayload(e.to_string()))
        }

        match envelope.kind.as_str() {
            REGISTER => {
                let register: RegisterPayload = payload(envelope.payload)?;
                register.validate()?;
                Ok(Self::Register(register))
            }
            CONNECT => {
                let connect: ConnectPayload = payload(envelope.payload)?;
                connect.validate()?;
                Ok(Self::Connect(connect))
            }
            PING => Ok(Self::Ping {
                timestamp: envelope.payload.get("timestamp").cloned(),
            }),
            PONG => Ok(Self::Pong),
            _ => Ok(Self::Forward(envelope)),
        }
    }
}

/// `pong` answering a ping, echoing its id and timestamp.
#[must_use]
pub fn pong(id: Option<String>, timestamp: Option<Value>) -> Envelope {
    let payload = timestamp.map_or(Value::Null, |ts| json!({ "timestamp": ts }));
    Envelope::new(PONG, payload).with_id(id)
}
