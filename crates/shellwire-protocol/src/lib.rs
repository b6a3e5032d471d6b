//! Wire types for the shell GUI backend protocol.
//!
//! Frames are JSON objects exchanged over one WebSocket. Requests carry a
//! `request_id`; every response frame for that request echoes it together with
//! a `request_state`. This crate knows how to build and classify those frames.
//! It does no I/O.

pub mod casing;
pub mod catalog;
pub mod envelope;
pub mod request;

pub use casing::{KeyCase, camel_to_snake, convert_keys, snake_to_camel};
pub use catalog::{MULTI_RESULT_APIS, ShellApi, is_multi_result};
pub use envelope::{
    EXECUTION_STARTED, RequestState, ResponseClass, ResponseEnvelope, StateTag, WebSessionData,
};
pub use request::{PromptReply, RequestKind, build_frame, cancel_frame, prompt_reply_frame};
