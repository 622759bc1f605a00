use crate::capability::CapabilitySet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientOp {
    Sub,
    Unsub,
    KvSub,
    JsSub,
    Cmd,
}

impl ClientOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientOp::Sub => "sub",
            ClientOp::Unsub => "unsub",
            ClientOp::KvSub => "kv_sub",
            ClientOp::JsSub => "js_sub",
            ClientOp::Cmd => "cmd",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub op: ClientOp,
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvSubOptions {
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsSubOptions {
    #[serde(default)]
    pub start_seq: u64,
    #[serde(default)]
    pub batch: i64,
    #[serde(default)]
    pub filter: String,
}

impl ClientFrame {
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.target.trim().is_empty() {
            return Err(FrameError::MissingTarget(self.op.as_str()));
        }
        Ok(())
    }

    pub fn kv_options(&self) -> Result<KvSubOptions, FrameError> {
        self.options()
    }

    pub fn js_options(&self) -> Result<JsSubOptions, FrameError> {
        self.options()
    }

    fn options<T: DeserializeOwned + Default>(&self) -> Result<T, FrameError> {
        match &self.data {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|err| FrameError::InvalidData(self.op.as_str(), err.to_string())),
        }
    }

    /// Bytes forwarded to the bus for a `cmd` frame. The payload is opaque:
    /// whatever JSON the client sent is passed on as-is.
    pub fn command_payload(&self) -> Vec<u8> {
        match &self.data {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => value.to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerOp {
    Msg,
    Reply,
    Error,
    CapUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub op: ServerOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServerFrame {
    pub fn msg(target: &str, data: Value) -> Self {
        Self {
            op: ServerOp::Msg,
            target: Some(target.to_string()),
            inbox: None,
            data: Some(data),
        }
    }

    pub fn reply(target: &str, inbox: Option<String>, data: Value) -> Self {
        Self {
            op: ServerOp::Reply,
            target: Some(target.to_string()),
            inbox,
            data: Some(data),
        }
    }

    pub fn reply_error(target: &str, inbox: Option<String>, message: &str) -> Self {
        Self::reply(target, inbox, json!({ "error": message }))
    }

    pub fn error(reason: &str) -> Self {
        Self {
            op: ServerOp::Error,
            target: None,
            inbox: None,
            data: Some(json!({ "reason": reason })),
        }
    }

    pub fn cap_update(caps: &CapabilitySet) -> Self {
        Self {
            op: ServerOp::CapUpdate,
            target: None,
            inbox: None,
            data: serde_json::to_value(caps).ok(),
        }
    }
}

/// Structured payloads are forwarded as JSON; anything else as text.
pub fn payload_value(bytes: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("{0} requires a target")]
    MissingTarget(&'static str),
    #[error("invalid {0} data: {1}")]
    InvalidData(&'static str, String),
}

impl FrameError {
    /// Short reason reported to the client in an `error` frame.
    pub fn reason(&self) -> String {
        match self {
            FrameError::OversizedFrame { .. } => "frame too large".to_string(),
            FrameError::Decode(_) => "bad json".to_string(),
            other => other.to_string(),
        }
    }
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8], max_frame_bytes: usize) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn decode_client_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<ClientFrame, FrameError> {
    let frame: ClientFrame = decode_frame(bytes, max_frame_bytes)?;
    frame.validate()?;
    Ok(frame)
}
