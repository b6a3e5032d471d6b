//! Outbound request frames.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Value of `request` for generic command execution.
pub const EXECUTE_REQUEST: &str = "execute";
/// Built-in request asking the backend to cancel a running request.
pub const CANCEL_REQUEST: &str = "cancel";
/// Built-in request answering a prompt raised by a running request.
pub const PROMPT_REPLY_REQUEST: &str = "prompt_reply";

/// How the request type is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// `{"request": "execute", "command": <type>}`.
    #[default]
    Execute,
    /// `{"request": <type>}`.
    Direct,
}

/// Builds an outbound frame from parameters that are already in wire casing.
///
/// Routing keys are written last, so a parameter cannot shadow them.
pub fn build_frame(kind: RequestKind, request_type: &str, request_id: &str, params: Map<String, Value>) -> Value {
    let mut frame = params;
    match kind {
        RequestKind::Execute => {
            frame.insert("request".into(), Value::String(EXECUTE_REQUEST.into()));
            frame.insert("command".into(), Value::String(request_type.into()));
        }
        RequestKind::Direct => {
            frame.insert("request".into(), Value::String(request_type.into()));
        }
    }
    frame.insert("request_id".into(), Value::String(request_id.into()));
    Value::Object(frame)
}

/// Frame cancelling the request with the given id. The backend answers on that same id.
pub fn cancel_frame(request_id: &str) -> Value {
    build_frame(RequestKind::Direct, CANCEL_REQUEST, request_id, Map::new())
}

/// Reply to a prompt the backend raised while running `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptReply {
    #[serde(rename = "type")]
    pub reply_type: String,
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_session_id: Option<String>,
}

pub fn prompt_reply_frame(request_id: &str, reply: &PromptReply) -> serde_json::Result<Value> {
    let params = match serde_json::to_value(reply)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(build_frame(RequestKind::Direct, PROMPT_REPLY_REQUEST, request_id, params))
}
