//! Named-signal notification bus with an optional bridge to an embedding host.
//!
//! Producers call [`RequisitionHub::execute`] with a signal name and a JSON
//! payload. Every callback registered for that name runs, the most recently
//! registered first, and the call reports whether any of them handled it.

use std::future::Future;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::future::{BoxFuture, join_all};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Signal names published by this crate.
pub mod signals {
    /// Payload: `bool`, true once the socket is open.
    pub const SOCKET_STATE_CHANGED: &str = "socketStateChanged";
    /// Payload: the session bootstrap frame in application casing.
    pub const WEB_SESSION_STARTED: &str = "webSessionStarted";
    /// Payload: `[title, text]`.
    pub const SHOW_ERROR: &str = "showError";
    /// Payload: `[title, text]`.
    pub const SHOW_INFO: &str = "showInfo";
    /// Payload: `{"request": frame}` or `{"response": frame}`.
    pub const DEBUGGER: &str = "debugger";
    /// Payload: list of `{requestType, parameter}` run in order.
    pub const JOB: &str = "job";
    pub const WRITE_CLIPBOARD: &str = "writeClipboard";
}

pub type CallbackFuture = BoxFuture<'static, Result<bool>>;

/// A bus callback. Identity is the `Arc` allocation.
pub type Callback = Arc<dyn Fn(Value) -> CallbackFuture + Send + Sync>;

/// Wraps an async closure as a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

fn same_callback(a: &Callback, b: &Callback) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// Message exchanged with an embedding host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedMessage {
    pub source: String,
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

/// Outbound half of the host bridge.
pub trait RemoteTarget: Send + Sync {
    fn post_message(&self, message: EmbeddedMessage);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardCommand {
    Paste,
    Cut,
    Copy,
}

impl ClipboardCommand {
    fn from_command(command: &str) -> Option<Self> {
        match command {
            "paste" => Some(Self::Paste),
            "cut" => Some(Self::Cut),
            "copy" => Some(Self::Copy),
            _ => None,
        }
    }
}

/// Local clipboard access for standalone (non-embedded) runs.
pub trait ClipboardHandler: Send + Sync {
    /// Handles a clipboard command coming from the host. Runs synchronously.
    fn handle(&self, command: ClipboardCommand, data: &Value);

    fn write_text(&self, text: &str);
}

/// One step of a `job` signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEntry {
    pub request_type: String,
    #[serde(default)]
    pub parameter: Value,
}

pub struct RequisitionHub {
    /// Name used as `source` on messages sent to the host.
    source: String,
    registry: DashMap<String, Vec<Callback>>,
    remote: Option<Arc<dyn RemoteTarget>>,
    clipboard: Option<Arc<dyn ClipboardHandler>>,
}

impl RequisitionHub {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            registry: DashMap::new(),
            remote: None,
            clipboard: None,
        }
    }

    pub fn with_remote_target(mut self, target: Arc<dyn RemoteTarget>) -> Self {
        self.remote = Some(target);
        self
    }

    pub fn with_clipboard(mut self, handler: Arc<dyn ClipboardHandler>) -> Self {
        self.clipboard = Some(handler);
        self
    }

    pub fn has_remote_target(&self) -> bool {
        self.remote.is_some()
    }

    /// Registers `callback` for `signal`. Registering the same callback twice is a no-op.
    pub fn register(&self, signal: &str, callback: Callback) {
        let mut list = self.registry.entry(signal.to_string()).or_default();
        if list.iter().any(|existing| same_callback(existing, &callback)) {
            return;
        }
        list.insert(0, callback);
        debug!("registered callback for {signal} ({} total)", list.len());
    }

    /// Without a signal everything is cleared. With only a signal its list is
    /// cleared. With both, that one callback is removed.
    pub fn unregister(&self, signal: Option<&str>, callback: Option<&Callback>) {
        match (signal, callback) {
            (None, _) => self.registry.clear(),
            (Some(signal), None) => {
                self.registry.remove(signal);
            }
            (Some(signal), Some(callback)) => {
                if let Some(mut list) = self.registry.get_mut(signal) {
                    list.retain(|existing| !same_callback(existing, callback));
                }
                self.registry.remove_if(signal, |_, list| list.is_empty());
            }
        }
    }

    pub fn registrations(&self, signal: &str) -> usize {
        self.registry.get(signal).map_or(0, |list| list.len())
    }

    fn snapshot(&self, signal: &str) -> Vec<Callback> {
        self.registry
            .get(signal)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Runs every callback for `signal` and waits for all of them.
    ///
    /// Returns true if at least one callback returned true. The first callback
    /// error is returned after all callbacks have finished.
    pub async fn execute(&self, signal: &str, payload: Value) -> Result<bool> {
        let callbacks = self.snapshot(signal);
        if callbacks.is_empty() {
            return Ok(false);
        }

        // Each callback runs to completion even if this future is dropped.
        let tasks: Vec<_> = callbacks
            .iter()
            .map(|cb| tokio::spawn(cb(payload.clone())))
            .collect();
        let mut handled = false;
        let mut first_error = None;
        for result in join_all(tasks).await {
            match result.map_err(anyhow::Error::from).and_then(|r| r) {
                Ok(value) => handled |= value,
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => warn!("additional callback error for {signal}: {err:#}"),
            }
        }
        match first_error {
            Some(err) => Err(err.context(format!("callback for {signal} failed"))),
            None => Ok(handled),
        }
    }

    /// Spawns [`execute`](Self::execute) without waiting. Errors are logged.
    pub fn execute_detached(self: &Arc<Self>, signal: &str, payload: Value) {
        let hub = Arc::clone(self);
        let signal = signal.to_string();
        tokio::spawn(async move {
            if let Err(err) = hub.execute(&signal, payload).await {
                warn!("{err:#}");
            }
        });
    }

    /// Forwards `signal` to the host without running local callbacks.
    pub fn execute_remote(&self, signal: &str, payload: Value) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };
        remote.post_message(EmbeddedMessage {
            source: self.source.clone(),
            command: signal.to_string(),
            data: payload,
        });
        true
    }

    /// Runs locally unless the request came from `origin`, and always forwards to the host.
    pub async fn broadcast_request(&self, origin: Option<&str>, signal: &str, payload: Value) -> Result<bool> {
        let mut handled = false;
        if origin.is_none() {
            handled = self.execute(signal, payload.clone()).await?;
        } else {
            debug!("not echoing {signal} back to {origin:?}");
        }
        let forwarded = self.execute_remote(signal, payload);
        Ok(handled || forwarded)
    }

    /// Inbound half of the host bridge.
    ///
    /// Clipboard commands go to the clipboard handler. Everything else is
    /// handed to local callbacks without waiting for them.
    pub fn handle_remote_message(&self, message: EmbeddedMessage) {
        if let Some(command) = ClipboardCommand::from_command(&message.command) {
            match &self.clipboard {
                Some(handler) => handler.handle(command, &message.data),
                None => debug!("no clipboard handler for {:?}", command),
            }
            return;
        }

        for cb in self.snapshot(&message.command) {
            let future = cb(message.data.clone());
            let command = message.command.clone();
            tokio::spawn(async move {
                if let Err(err) = future.await {
                    warn!("remote callback for {command} failed: {err:#}");
                }
            });
        }
    }

    /// Embedded runs cannot reach the clipboard themselves, so the host is asked to write it.
    pub fn write_to_clipboard(&self, text: &str) {
        if self.execute_remote(signals::WRITE_CLIPBOARD, json!({ "text": text })) {
            return;
        }
        match &self.clipboard {
            Some(handler) => handler.write_text(text),
            None => warn!("clipboard write dropped: no clipboard handler"),
        }
    }

    /// Registers the `job` signal, which runs a list of requisitions one after another.
    pub fn install_job_pipeline(self: &Arc<Self>) {
        let hub: Weak<Self> = Arc::downgrade(self);
        self.register(
            signals::JOB,
            callback(move |payload| {
                let hub = hub.clone();
                async move {
                    let Some(hub) = hub.upgrade() else {
                        return Ok(false);
                    };
                    let entries: Vec<JobEntry> =
                        serde_json::from_value(payload).context("parsing job entries")?;
                    info!("running job with {} step(s)", entries.len());
                    for entry in entries {
                        hub.execute(&entry.request_type, entry.parameter).await?;
                    }
                    Ok(true)
                }
            }),
        );
    }
}

impl Default for RequisitionHub {
    fn default() -> Self {
        Self::new("app")
    }
}
