//! Interactive helpers for poking the backend with hand-written frames.
//!
//! Frames are sent in wire casing through [`MessageScheduler::send_listened`]
//! while the scheduler is in debugging mode. Responses are remembered in wire
//! casing as well, so they can be fed straight back into a follow-up frame.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use serde_json::{Value, json};

use crate::dispatch::{DispatchContext, DispatchEvent};
use crate::error::SchedulerResult;
use crate::matcher::deep_equal;
use crate::scheduler::{MessageScheduler, new_request_id};

/// Message class of debugger output and debugger-originated requests.
pub const DEBUGGER_CLASS: &str = "debugger";

/// Message class used while validating a response sequence.
pub const VALIDATE_CLASS: &str = "debuggerValidate";

const NO_RESPONSE_MESSAGE: &str = "No response from backend in 3 seconds";

#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    pub response_timeout: Duration,
    pub validate_poll: Duration,
    pub validate_attempts: u32,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(3_000),
            validate_poll: Duration::from_millis(300),
            validate_attempts: 10,
        }
    }
}

impl DebuggerConfig {
    fn validation_window(&self) -> Duration {
        self.validate_poll * self.validate_attempts
    }
}

/// Result of [`CommunicationDebugger::send_and_validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Every expected response arrived and matched.
    Succeeded,
    /// A response differed, or the backend reported an error.
    Failed,
    /// Fewer responses than expected arrived within the window.
    Incomplete,
}

#[derive(Default)]
struct DebuggerState {
    last_generated_id: String,
    last_module_session_id: String,
    last_response: Option<Value>,
}

/// Resets the scheduler's debugging flag when dropped.
struct DebuggingGuard<'a>(&'a MessageScheduler);

impl<'a> DebuggingGuard<'a> {
    fn enter(scheduler: &'a MessageScheduler) -> Self {
        scheduler.set_debugging(true);
        Self(scheduler)
    }
}

impl Drop for DebuggingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_debugging(false);
    }
}

pub struct CommunicationDebugger {
    scheduler: MessageScheduler,
    config: DebuggerConfig,
    state: Mutex<DebuggerState>,
}

impl CommunicationDebugger {
    pub fn new(scheduler: MessageScheduler, config: DebuggerConfig) -> Self {
        Self {
            scheduler,
            config,
            state: Mutex::new(DebuggerState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DebuggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a request id and remembers it as the last generated one.
    pub fn generate_request_id(&self) -> String {
        let id = new_request_id();
        self.state().last_generated_id = id.clone();
        id
    }

    pub fn last_generated_request_id(&self) -> String {
        self.state().last_generated_id.clone()
    }

    pub fn last_module_session_id(&self) -> String {
        self.state().last_module_session_id.clone()
    }

    /// Last response received, in wire casing.
    pub fn last_response(&self) -> Option<Value> {
        self.state().last_response.clone()
    }

    pub fn clear_state(&self) {
        *self.state() = DebuggerState::default();
    }

    fn remember(&self, event: &DispatchEvent) -> Value {
        let response = event.raw.clone();
        let mut state = self.state();
        if let Some(id) = response.get("module_session_id").and_then(Value::as_str)
            && !id.is_empty()
        {
            state.last_module_session_id = id.to_string();
        }
        state.last_response = Some(response.clone());
        response
    }

    /// Sends a wire frame and returns the first response in wire casing.
    ///
    /// Without a response in time, a synthetic `ERROR` response is returned
    /// and any late answer is ignored.
    pub async fn send(&self, frame: Value) -> SchedulerResult<Value> {
        let _guard = DebuggingGuard::enter(&self.scheduler);
        let (request_id, mut listener) = self
            .scheduler
            .send_listened(frame, DispatchContext::new(DEBUGGER_CLASS))
            .await?;

        match tokio::time::timeout(self.config.response_timeout, listener.next_event()).await {
            Ok(Some(event)) => Ok(self.remember(&event)),
            Ok(None) | Err(_) => {
                debug!("no response for debugger request {request_id}");
                self.scheduler.dispatcher().forget_message_context(&request_id);
                Ok(json!({
                    "request_id": request_id,
                    "request_state": {"type": "ERROR", "msg": NO_RESPONSE_MESSAGE},
                }))
            }
        }
    }

    /// Compares a response with an expectation and logs the outcome.
    pub fn validate_response(&self, actual: Option<&Value>, expected: Option<&Value>, index: Option<usize>) -> bool {
        let equal = match (expected, actual) {
            (Some(expected), Some(actual)) => deep_equal(expected, actual),
            (None, None) => true,
            _ => false,
        };
        let index_text = index.map(|i| format!(" (response {i})")).unwrap_or_default();
        if equal {
            self.log(&format!("/* Validation successful{index_text}. */"));
        } else {
            self.log(&format!(
                "/* WARNING: values differ{index_text}.\nActual:\n{}\nExpected:\n{}\n*/",
                pretty(actual),
                pretty(expected)
            ));
        }
        equal
    }

    pub fn validate_last_response(&self, expected: &Value, index: Option<usize>) -> bool {
        let actual = self.last_response();
        self.validate_response(actual.as_ref(), Some(expected), index)
    }

    /// Sends a frame and checks the responses against `expected`, in order.
    ///
    /// Responses beyond the expected count are ignored. An error response
    /// fails the validation immediately.
    pub async fn send_and_validate(&self, frame: Value, expected: &[Value]) -> SchedulerResult<ValidationOutcome> {
        if expected.is_empty() {
            self.log("/* WARNING: No expectations found. */");
        }

        let _guard = DebuggingGuard::enter(&self.scheduler);
        self.state().last_response = None;
        let (request_id, mut listener) = self
            .scheduler
            .send_listened(frame, DispatchContext::new(VALIDATE_CLASS))
            .await?;

        let deadline = tokio::time::Instant::now() + self.config.validation_window();
        let mut index = 0;
        let mut failed = false;
        while !failed && index < expected.len() {
            let Ok(Some(event)) = tokio::time::timeout_at(deadline, listener.next_event()).await else {
                break;
            };
            let response = self.remember(&event);
            if event.event_type.is_error() {
                failed = true;
                break;
            }
            failed = !self.validate_response(Some(&response), Some(&expected[index]), Some(index));
            index += 1;
        }

        let outcome = if failed {
            self.log("/* WARNING: At least one validation failed. */");
            ValidationOutcome::Failed
        } else if index < expected.len() {
            self.scheduler.dispatcher().forget_message_context(&request_id);
            self.log(&format!(
                "/* WARNING: Validation incomplete. Not enough responses came in during the timeout of {} seconds. */",
                self.config.validation_window().as_secs_f64()
            ));
            ValidationOutcome::Incomplete
        } else {
            self.log("/* All validations succeeded. */");
            ValidationOutcome::Succeeded
        };
        Ok(outcome)
    }

    /// Publishes a line of debugger output.
    pub fn log(&self, output: &str) {
        self.scheduler
            .dispatcher()
            .trigger_notification(DEBUGGER_CLASS, json!({ "output": output }));
    }
}

fn pretty(value: Option<&Value>) -> String {
    match value {
        Some(value) => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        None => "undefined".to_string(),
    }
}
