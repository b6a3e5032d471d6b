//! Inbound response envelopes and their classification.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message text the backend uses for the first PENDING frame of an execution.
pub const EXECUTION_STARTED: &str = "Execution started...";

/// Field present only in the session bootstrap frame.
pub const SESSION_UUID_FIELD: &str = "session_uuid";

/// State tag carried in `request_state.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateTag {
    Ok,
    Error,
    Pending,
    Cancelled,
    #[serde(other)]
    Unknown,
}

/// The `request_state` object of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestState {
    #[serde(rename = "type")]
    pub tag: StateTag,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl RequestState {
    pub fn new(tag: StateTag, msg: impl Into<String>) -> Self {
        Self {
            tag,
            msg: msg.into(),
            code: None,
        }
    }
}

/// What a single inbound frame means for its pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Execution acknowledged; carries no payload.
    Start,
    /// Intermediate result.
    Data,
    /// End of one logical result; more may follow.
    End,
    /// Last frame of the request.
    Final,
    Error,
    Cancel,
    /// Unrecognised state tag, ignored by routing.
    Unknown,
}

impl ResponseClass {
    /// True for classes that retire the pending request.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Final | Self::Error | Self::Cancel)
    }
}

/// One inbound frame in wire casing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub request_state: Option<RequestState>,
    #[serde(default)]
    pub done: Option<bool>,
    /// Everything else in the frame.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ResponseEnvelope {
    /// Parses a raw text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn classify(&self) -> ResponseClass {
        let Some(state) = &self.request_state else {
            return ResponseClass::Unknown;
        };
        match state.tag {
            StateTag::Error => ResponseClass::Error,
            StateTag::Pending if state.msg == EXECUTION_STARTED => ResponseClass::Start,
            StateTag::Pending => ResponseClass::Data,
            StateTag::Ok if self.done == Some(true) => ResponseClass::Final,
            StateTag::Ok => ResponseClass::End,
            StateTag::Cancelled => ResponseClass::Cancel,
            StateTag::Unknown => ResponseClass::Unknown,
        }
    }

    /// True for the frame the backend sends when a new web session is created.
    pub fn is_session_start(&self) -> bool {
        self.fields
            .get(SESSION_UUID_FIELD)
            .is_some_and(|v| !v.is_null())
    }

    /// The result carried by this frame, still in wire casing.
    ///
    /// A `result` field wins. Otherwise the remaining fields form the payload.
    /// Start frames and frames with nothing besides routing fields have none.
    pub fn payload(&self) -> Option<Value> {
        if self.classify() == ResponseClass::Start {
            return None;
        }
        if let Some(result) = self.fields.get("result") {
            return Some(result.clone());
        }
        if self.fields.is_empty() {
            return None;
        }
        Some(Value::Object(self.fields.clone()))
    }

    pub fn message(&self) -> &str {
        self.request_state.as_ref().map_or("", |s| s.msg.as_str())
    }

    pub fn code(&self) -> Option<i64> {
        self.request_state.as_ref().and_then(|s| s.code)
    }
}

/// Data sent with the session bootstrap frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSessionData {
    pub session_uuid: String,
    #[serde(default)]
    pub local_user_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_profile: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}
