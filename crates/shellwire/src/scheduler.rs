//! Message scheduler: one socket, many concurrent requests.
//!
//! Every outbound request gets a correlation id and a pending record. A
//! single reader task per connection classifies inbound frames and feeds the
//! matching record until a terminal frame retires it. Connection changes and
//! session bootstrap frames are announced on the [`RequisitionHub`].
//!
//! Lost connections are re-opened with exponential backoff unless the caller
//! disconnected explicitly or the debugger is capturing traffic.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use serde_json::{Map, Value, json};
use shellwire_protocol::{
    KeyCase, PromptReply, RequestKind, ResponseClass, ResponseEnvelope, ShellApi, WebSessionData,
    build_frame, cancel_frame, convert_keys, is_multi_result, prompt_reply_frame,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use crate::bus::{RequisitionHub, signals};
use crate::dispatch::{DispatchContext, DispatchEvent, Dispatcher, Subscription};
use crate::endpoint::{self, DEVELOPMENT_PORT};
use crate::error::{ResponseError, SchedulerError, SchedulerResult, TransportError};
use crate::listener::Listener;
use crate::transport::{FrameSink, FrameStream, Transport, TransportFactory};

/// Base reconnect interval.
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;

/// Upper bound for the reconnect interval.
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 300_000;

/// Keys whose values pass through case conversion verbatim.
pub const DEFAULT_CASE_EXCEPTIONS: &[&str] = &["rows"];

/// Configuration for the message scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub development_mode: bool,
    pub development_port: u16,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub case_exceptions: Vec<String>,
    /// Mirror all traffic on the `debugger` bus signal.
    pub trace: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            development_mode: false,
            development_port: DEVELOPMENT_PORT,
            reconnect_base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            case_exceptions: DEFAULT_CASE_EXCEPTIONS.iter().map(|s| s.to_string()).collect(),
            trace: false,
        }
    }
}

/// Called with `(payload, request_id)` for every intermediate result.
pub type DataCallback = Arc<dyn Fn(Value, &str) + Send + Sync>;

/// Where to connect.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// HTTP(S) base URL of the backend.
    pub url: Url,
    /// Backend configuration folder, passed to the transport untouched.
    pub shell_config_dir: Option<PathBuf>,
}

impl ConnectTarget {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            shell_config_dir: None,
        }
    }
}

/// A request in application casing.
#[derive(Clone)]
pub struct RequestDetails {
    pub request_type: String,
    pub kind: RequestKind,
    /// JSON object with camelCase keys. `Null` means no parameters.
    pub parameters: Value,
    pub request_id: Option<String>,
    pub on_data: Option<DataCallback>,
    /// Overrides the configured exception list.
    pub case_exceptions: Option<Vec<String>>,
    /// Overrides the catalog's multi-result flag.
    pub multi_result: Option<bool>,
}

impl RequestDetails {
    /// `{"request": "execute", "command": request_type}`.
    pub fn execute(request_type: impl Into<String>) -> Self {
        Self::new(request_type.into(), RequestKind::Execute)
    }

    /// `{"request": request_type}`.
    pub fn direct(request_type: impl Into<String>) -> Self {
        Self::new(request_type.into(), RequestKind::Direct)
    }

    fn new(request_type: String, kind: RequestKind) -> Self {
        Self {
            request_type,
            kind,
            parameters: Value::Null,
            request_id: None,
            on_data: None,
            case_exceptions: None,
            multi_result: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_case_exceptions<I, S>(mut self, exceptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.case_exceptions = Some(exceptions.into_iter().map(Into::into).collect());
        self
    }

    pub fn multi_result(mut self, multi: bool) -> Self {
        self.multi_result = Some(multi);
        self
    }

    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &str) + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(f));
        self
    }
}

/// Resolved value of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Single(Value),
    List(Vec<Value>),
}

impl ResponsePayload {
    pub fn into_value(self) -> Value {
        match self {
            Self::Single(value) => value,
            Self::List(values) => Value::Array(values),
        }
    }

    pub fn into_list(self) -> Vec<Value> {
        match self {
            Self::Single(Value::Null) => Vec::new(),
            Self::Single(value) => vec![value],
            Self::List(values) => values,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Open,
}

struct PendingRequest {
    result_kind: String,
    multi_result: bool,
    accumulated: Vec<Value>,
    on_data: Option<DataCallback>,
    responder: Option<oneshot::Sender<SchedulerResult<ResponsePayload>>>,
    /// `None` leaves inbound payloads in wire casing.
    case_exceptions: Option<Vec<String>>,
}

impl PendingRequest {
    fn convert(&self, payload: Value) -> Value {
        match &self.case_exceptions {
            Some(exceptions) => convert_keys(&payload, KeyCase::Camel, exceptions),
            None => payload,
        }
    }
}

struct ConnectionState {
    phase: ConnectionPhase,
    /// Bumped for every new transport and on disconnect.
    epoch: u64,
    target: Option<ConnectTarget>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    /// At most one pending reconnect. While set, no other timer is scheduled.
    reconnect: Option<JoinHandle<()>>,
    reconnect_delay: Duration,
    last_scheduled_delay: Option<Duration>,
    disconnecting: bool,
    waiters: Vec<oneshot::Sender<SchedulerResult<()>>>,
    session: Option<WebSessionData>,
}

struct Inner {
    config: SchedulerConfig,
    factory: Arc<dyn TransportFactory>,
    hub: Arc<RequisitionHub>,
    dispatcher: Arc<Dispatcher>,
    pending: DashMap<String, PendingRequest>,
    state: Mutex<ConnectionState>,
    trace: AtomicBool,
    debugging: AtomicBool,
}

/// Handle to a scheduler. Clones share the same connection.
#[derive(Clone)]
pub struct MessageScheduler {
    inner: Arc<Inner>,
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl MessageScheduler {
    pub fn new(
        config: SchedulerConfig,
        factory: Arc<dyn TransportFactory>,
        hub: Arc<RequisitionHub>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let state = ConnectionState {
            phase: ConnectionPhase::Disconnected,
            epoch: 0,
            target: None,
            outbound: None,
            reader: None,
            reconnect: None,
            reconnect_delay: config.reconnect_base,
            last_scheduled_delay: None,
            disconnecting: false,
            waiters: Vec::new(),
            session: None,
        };
        let trace = AtomicBool::new(config.trace);
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                hub,
                dispatcher,
                pending: DashMap::new(),
                state: Mutex::new(state),
                trace,
                debugging: AtomicBool::new(false),
            }),
        }
    }

    pub fn hub(&self) -> &Arc<RequisitionHub> {
        &self.inner.hub
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Opens the connection, or joins the attempt already in progress.
    pub async fn connect(&self, target: &ConnectTarget) -> SchedulerResult<()> {
        self.inner.connect(target).await
    }

    /// Closes the connection and suppresses automatic reconnects.
    ///
    /// In-flight requests are left pending.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.phase == ConnectionPhase::Open
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.inner.state.lock().await.phase
    }

    /// Interval the next reconnect would be scheduled with.
    pub async fn reconnect_delay(&self) -> Duration {
        self.inner.state.lock().await.reconnect_delay
    }

    /// Interval of the most recently scheduled reconnect timer.
    pub async fn last_scheduled_reconnect(&self) -> Option<Duration> {
        self.inner.state.lock().await.last_scheduled_delay
    }

    pub async fn reconnect_pending(&self) -> bool {
        self.inner.state.lock().await.reconnect.is_some()
    }

    /// Data from the last session bootstrap frame. Cleared on close.
    pub async fn web_session(&self) -> Option<WebSessionData> {
        self.inner.state.lock().await.session.clone()
    }

    pub fn trace_enabled(&self) -> bool {
        self.inner.trace.load(Ordering::Relaxed)
    }

    pub fn set_trace_enabled(&self, enabled: bool) {
        self.inner.trace.store(enabled, Ordering::Relaxed);
    }

    pub fn is_debugging(&self) -> bool {
        self.inner.debugging.load(Ordering::Relaxed)
    }

    /// Debug capture mode: no reconnects and no session announcements.
    pub fn set_debugging(&self, debugging: bool) {
        self.inner.debugging.store(debugging, Ordering::Relaxed);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn has_pending(&self, request_id: &str) -> bool {
        self.inner.pending.contains_key(request_id)
    }

    /// Sends a request and waits for its result.
    ///
    /// Parameter keys are converted to snake_case and payload keys back to
    /// camelCase, except for the configured exception keys.
    pub async fn send_request(&self, details: RequestDetails) -> SchedulerResult<ResponsePayload> {
        let exceptions = details
            .case_exceptions
            .unwrap_or_else(|| self.inner.config.case_exceptions.clone());
        let params = match details.parameters {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            _ => {
                return Err(SchedulerError::InvalidRequest(
                    "parameters must be a JSON object".into(),
                ));
            }
        };
        let wire = match convert_keys(&Value::Object(params), KeyCase::Snake, &exceptions) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let multi_result = details
            .multi_result
            .unwrap_or_else(|| is_multi_result(&details.request_type));
        let request_id = details.request_id.unwrap_or_else(new_request_id);
        let frame = build_frame(details.kind, &details.request_type, &request_id, wire);

        let record = PendingRequest {
            result_kind: details.request_type,
            multi_result,
            accumulated: Vec::new(),
            on_data: details.on_data,
            responder: None,
            case_exceptions: Some(exceptions),
        };
        self.inner.dispatch(request_id, frame, record).await
    }

    /// Sends a typed request. Field names come from the declared types.
    pub async fn send<A: ShellApi>(&self, params: A::Params) -> SchedulerResult<A::Output> {
        let params = match serde_json::to_value(params)? {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            _ => {
                return Err(SchedulerError::InvalidRequest(format!(
                    "parameters of {} must serialize to an object",
                    A::NAME
                )));
            }
        };
        let request_id = new_request_id();
        let frame = build_frame(RequestKind::Execute, A::NAME, &request_id, params);
        let record = PendingRequest {
            result_kind: A::NAME.to_string(),
            multi_result: A::MULTI_RESULT,
            accumulated: Vec::new(),
            on_data: None,
            responder: None,
            case_exceptions: None,
        };
        let payload = self.inner.dispatch(request_id, frame, record).await?;
        Ok(serde_json::from_value(payload.into_value())?)
    }

    /// Sends a prebuilt wire frame without any case conversion.
    ///
    /// A `request_id` is added when the frame has none.
    pub async fn send_raw_request(
        &self,
        frame: Value,
        on_data: Option<DataCallback>,
    ) -> SchedulerResult<ResponsePayload> {
        let (request_id, frame) = ensure_request_id(frame)?;
        let result_kind = frame
            .get("command")
            .or_else(|| frame.get("request"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !self.is_debugging() {
            self.inner
                .dispatcher
                .trigger_event(DispatchEvent::request(request_id.clone(), frame.clone()));
        }
        let record = PendingRequest {
            result_kind,
            multi_result: false,
            accumulated: Vec::new(),
            on_data,
            responder: None,
            case_exceptions: None,
        };
        self.inner.dispatch(request_id, frame, record).await
    }

    /// Sends a raw frame and returns a dispatcher listener for its responses.
    ///
    /// No pending record is created; every response for the id reaches the listener.
    pub async fn send_listened(&self, frame: Value, context: DispatchContext) -> SchedulerResult<(String, Listener)> {
        let (request_id, frame) = ensure_request_id(frame)?;
        let dispatcher = &self.inner.dispatcher;
        dispatcher.map_message_context(request_id.clone(), context);
        let listener = dispatcher.subscribe(Subscription::by_id(request_id.clone()).skip_requests());
        self.inner.transmit(&request_id, &frame).await;
        if !self.is_debugging() {
            dispatcher.trigger_event(DispatchEvent::request(request_id.clone(), frame));
        }
        Ok((request_id, listener))
    }

    /// Asks the backend to cancel `request_id`. Its record gets the CANCELLED frame.
    pub async fn cancel_request(&self, request_id: &str) -> SchedulerResult<()> {
        if request_id.is_empty() {
            return Err(SchedulerError::InvalidRequest("empty request id".into()));
        }
        self.inner.transmit(request_id, &cancel_frame(request_id)).await;
        Ok(())
    }

    /// Answers a prompt raised by the running request `request_id`.
    pub async fn prompt_reply(&self, request_id: &str, reply: &PromptReply) -> SchedulerResult<()> {
        let frame = prompt_reply_frame(request_id, reply)?;
        self.inner.transmit(request_id, &frame).await;
        Ok(())
    }
}

fn ensure_request_id(frame: Value) -> SchedulerResult<(String, Value)> {
    let Value::Object(mut map) = frame else {
        return Err(SchedulerError::InvalidRequest("frame must be a JSON object".into()));
    };
    let request_id = match map.get("request_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let id = new_request_id();
            map.insert("request_id".into(), Value::String(id.clone()));
            id
        }
    };
    Ok((request_id, Value::Object(map)))
}

impl Inner {
    async fn connect(self: &Arc<Self>, target: &ConnectTarget) -> SchedulerResult<()> {
        let url = endpoint::socket_url(
            &target.url,
            self.config.development_mode,
            self.config.development_port,
        )?;

        let waiter = {
            let mut state = self.state.lock().await;
            state.disconnecting = false;
            state.target = Some(target.clone());
            let (tx, rx) = oneshot::channel();
            match state.phase {
                ConnectionPhase::Open => return Ok(()),
                ConnectionPhase::Connecting => state.waiters.push(tx),
                ConnectionPhase::Disconnected => {
                    state.waiters.push(tx);
                    state.phase = ConnectionPhase::Connecting;
                    state.epoch += 1;
                    info!("connecting to {url}");
                    tokio::spawn(Arc::clone(self).run_connection(
                        url,
                        target.shell_config_dir.clone(),
                        state.epoch,
                    ));
                }
            }
            rx
        };

        waiter
            .await
            .unwrap_or(Err(SchedulerError::Transport(TransportError::Closed)))
    }

    async fn run_connection(self: Arc<Self>, url: Url, shell_config_dir: Option<PathBuf>, epoch: u64) {
        match self.factory.connect(&url, shell_config_dir.as_deref()).await {
            Ok(transport) => self.on_open(epoch, transport).await,
            Err(err) => self.on_open_failed(epoch, err).await,
        }
    }

    async fn on_open(self: &Arc<Self>, epoch: u64, transport: Transport) {
        let Transport { sink, stream } = transport;
        let recovered = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch || state.disconnecting {
                debug!("dropping superseded transport (epoch {epoch})");
                drop(state);
                close_sink(sink).await;
                return;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.outbound = Some(tx);
            tokio::spawn(writer_task(sink, rx));
            state.reader = Some(tokio::spawn(Arc::clone(self).reader_task(stream, epoch)));
            state.phase = ConnectionPhase::Open;
            state.reconnect_delay = self.config.reconnect_base;
            state.reconnect.take().map(|timer| timer.abort()).is_some()
        };

        if recovered {
            info!("connection recovered");
            self.hub.execute_detached(
                signals::SHOW_INFO,
                json!([
                    "Connection Recovering",
                    "The connection was automatically re-established after a failure."
                ]),
            );
        }

        // Pending connect calls resolve only after subscribers saw the state change.
        if let Err(err) = self.hub.execute(signals::SOCKET_STATE_CHANGED, json!(true)).await {
            warn!("socket state subscriber failed: {err:#}");
        }

        let (waiters, result) = {
            let mut state = self.state.lock().await;
            let result = if state.epoch == epoch && state.outbound.is_some() {
                Ok(())
            } else {
                Err(SchedulerError::Transport(TransportError::Closed))
            };
            (std::mem::take(&mut state.waiters), result)
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    async fn on_open_failed(self: &Arc<Self>, epoch: u64, err: TransportError) {
        let (waiters, wait) = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch {
                return;
            }
            state.phase = ConnectionPhase::Disconnected;
            state.reconnect_delay = (state.reconnect_delay * 2).min(self.config.reconnect_max);
            let wait = state.reconnect_delay;
            let retry = state.reconnect.is_some() && !state.disconnecting && !self.is_debugging();
            if retry {
                self.schedule_reconnect(&mut state);
            }
            (std::mem::take(&mut state.waiters), wait)
        };

        warn!("connection attempt failed: {err}");
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone().into()));
        }
        self.hub.execute_detached(
            signals::SHOW_ERROR,
            json!([
                "Communication Error",
                format!(
                    "Could not establish a connection to the backend. Next attempt in {} s.",
                    wait.as_secs_f64()
                )
            ]),
        );
    }

    async fn on_close(self: &Arc<Self>, epoch: u64) {
        let waiters = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch {
                return;
            }
            state.phase = ConnectionPhase::Disconnected;
            state.outbound = None;
            state.reader = None;
            state.session = None;
            if !state.disconnecting && !self.is_debugging() && state.reconnect.is_none() {
                self.schedule_reconnect(&mut state);
            }
            std::mem::take(&mut state.waiters)
        };

        info!("connection closed");
        for waiter in waiters {
            let _ = waiter.send(Err(SchedulerError::Transport(TransportError::Closed)));
        }
        if let Err(err) = self.hub.execute(signals::SOCKET_STATE_CHANGED, json!(false)).await {
            warn!("socket state subscriber failed: {err:#}");
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ConnectionState) {
        let delay = state.reconnect_delay;
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let target = inner.state.lock().await.target.clone();
            if let Some(target) = target
                && let Err(err) = inner.connect(&target).await
            {
                debug!("reconnect attempt failed: {err}");
            }
        });
        debug!("reconnect scheduled in {delay:?}");
        state.last_scheduled_delay = Some(delay);
        if let Some(previous) = state.reconnect.replace(timer) {
            previous.abort();
        }
    }

    async fn disconnect(&self) {
        let (reader, was_open) = {
            let mut state = self.state.lock().await;
            state.disconnecting = true;
            state.epoch += 1;
            if let Some(timer) = state.reconnect.take() {
                timer.abort();
            }
            let was_open = state.outbound.take().is_some();
            state.phase = ConnectionPhase::Disconnected;
            state.session = None;
            for waiter in std::mem::take(&mut state.waiters) {
                let _ = waiter.send(Err(SchedulerError::Transport(TransportError::Closed)));
            }
            (state.reader.take(), was_open)
        };

        // Dropping the outbound sender lets the writer close the sink.
        if let Some(reader) = reader {
            reader.abort();
        }
        if was_open {
            info!("disconnected");
            if let Err(err) = self.hub.execute(signals::SOCKET_STATE_CHANGED, json!(false)).await {
                warn!("socket state subscriber failed: {err:#}");
            }
        }
    }

    fn is_debugging(&self) -> bool {
        self.debugging.load(Ordering::Relaxed)
    }

    /// Registers the record, then writes the frame.
    async fn dispatch(
        &self,
        request_id: String,
        frame: Value,
        mut record: PendingRequest,
    ) -> SchedulerResult<ResponsePayload> {
        let (tx, rx) = oneshot::channel();
        record.responder = Some(tx);
        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => return Err(SchedulerError::DuplicateRequestId(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }

        self.transmit(&request_id, &frame).await;

        rx.await
            .unwrap_or(Err(SchedulerError::Abandoned(request_id)))
    }

    /// Writes a frame if a transport is live; otherwise drops it.
    async fn transmit(&self, request_id: &str, frame: &Value) {
        if self.trace.load(Ordering::Relaxed) {
            self.trace_frame(json!({ "request": frame }));
        }
        let state = self.state.lock().await;
        match &state.outbound {
            Some(tx) if tx.send(frame.to_string()).is_ok() => trace!("sent request {request_id}"),
            _ => debug!("no live transport; request {request_id} not sent"),
        }
    }

    fn trace_frame(&self, data: Value) {
        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            if let Err(err) = hub.execute(signals::DEBUGGER, data).await {
                warn!("debugger trace subscriber failed: {err:#}");
            }
        });
    }

    async fn reader_task(self: Arc<Self>, mut stream: FrameStream, epoch: u64) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(text) => self.on_message(&text).await,
                Err(TransportError::Closed) => break,
                Err(err) => {
                    warn!("transport error: {err}");
                    break;
                }
            }
        }
        self.on_close(epoch).await;
    }

    async fn on_message(self: &Arc<Self>, text: &str) {
        let raw: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => return self.report_malformed(&err.to_string()),
        };
        let envelope = match ResponseEnvelope::from_value(raw.clone()) {
            Ok(envelope) => envelope,
            Err(err) => return self.report_malformed(&err.to_string()),
        };

        if self.trace.load(Ordering::Relaxed) {
            self.trace_frame(json!({ "response": raw }));
        }

        let app_data = convert_keys(&raw, KeyCase::Camel, &self.config.case_exceptions);

        if envelope.is_session_start() {
            if self.is_debugging() {
                return;
            }
            match serde_json::from_value::<WebSessionData>(Value::Object(envelope.fields.clone())) {
                Ok(session) => {
                    info!("web session {} started", session.session_uuid);
                    self.state.lock().await.session = Some(session);
                }
                Err(err) => warn!("unreadable session bootstrap frame: {err}"),
            }
            self.hub.execute_detached(signals::WEB_SESSION_STARTED, app_data);
            return;
        }

        let class = envelope.classify();
        let Some(request_id) = envelope.request_id.clone() else {
            debug!("dropping {class:?} frame without request id");
            return;
        };

        self.dispatcher.trigger_event(DispatchEvent::response(
            Some(request_id.clone()),
            class,
            envelope.message(),
            app_data.clone(),
        )
        .with_raw(raw));

        self.route(&request_id, class, &envelope, app_data);
    }

    fn report_malformed(&self, detail: &str) {
        warn!("malformed frame: {detail}");
        self.hub.execute_detached(
            signals::SHOW_ERROR,
            json!([
                "Communication Error",
                format!("Could not parse JSON from server: {detail}")
            ]),
        );
    }

    /// Feeds one classified frame to its pending record.
    ///
    /// Callbacks run after the map guard is released.
    fn route(&self, request_id: &str, class: ResponseClass, envelope: &ResponseEnvelope, app_data: Value) {
        match class {
            ResponseClass::Start | ResponseClass::Unknown => {
                if !self.pending.contains_key(request_id) {
                    debug!("orphan {class:?} frame for {request_id}");
                }
            }
            ResponseClass::Data => {
                let forward = {
                    let Some(mut record) = self.pending.get_mut(request_id) else {
                        debug!("orphan data frame for {request_id}");
                        return;
                    };
                    let Some(payload) = envelope.payload().map(|p| record.convert(p)) else {
                        return;
                    };
                    match record.on_data.clone() {
                        Some(callback) => Some((callback, payload)),
                        None => {
                            record.accumulated.push(payload);
                            None
                        }
                    }
                };
                if let Some((callback, payload)) = forward {
                    callback(payload, request_id);
                }
            }
            ResponseClass::End => {
                let Some(mut record) = self.pending.get_mut(request_id) else {
                    debug!("orphan end frame for {request_id}");
                    return;
                };
                let payload = envelope.payload().map(|p| record.convert(p));
                if record.multi_result {
                    record.accumulated.extend(payload);
                } else if let Some(responder) = record.responder.take() {
                    let _ = responder.send(Ok(ResponsePayload::Single(payload.unwrap_or(Value::Null))));
                }
            }
            ResponseClass::Final => {
                let Some((_, mut record)) = self.pending.remove(request_id) else {
                    debug!("orphan final frame for {request_id}");
                    return;
                };
                if let Some(payload) = envelope.payload() {
                    let payload = record.convert(payload);
                    record.accumulated.push(payload);
                }
                trace!("{} ({request_id}) finished", record.result_kind);
                if let Some(responder) = record.responder.take() {
                    let result = if record.multi_result {
                        ResponsePayload::List(record.accumulated)
                    } else {
                        ResponsePayload::Single(
                            record.accumulated.into_iter().next().unwrap_or(Value::Null),
                        )
                    };
                    let _ = responder.send(Ok(result));
                }
            }
            ResponseClass::Error => {
                let Some((_, mut record)) = self.pending.remove(request_id) else {
                    debug!("orphan error frame for {request_id}");
                    return;
                };
                debug!("{} ({request_id}) failed: {}", record.result_kind, envelope.message());
                if let Some(responder) = record.responder.take() {
                    let _ = responder.send(Err(SchedulerError::Response(ResponseError {
                        request_id: request_id.to_string(),
                        message: envelope.message().to_string(),
                        code: envelope.code(),
                        data: app_data,
                    })));
                }
            }
            ResponseClass::Cancel => {
                let Some((_, mut record)) = self.pending.remove(request_id) else {
                    debug!("orphan cancel frame for {request_id}");
                    return;
                };
                if let Some(responder) = record.responder.take() {
                    let _ = responder.send(Ok(ResponsePayload::List(Vec::new())));
                }
            }
        }
    }
}

async fn writer_task(mut sink: FrameSink, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        if let Err(err) = sink.send(text).await {
            warn!("failed to write frame: {err}");
            break;
        }
    }
    close_sink(sink).await;
}

async fn close_sink(mut sink: FrameSink) {
    if let Err(err) = sink.close().await {
        debug!("error while closing transport: {err}");
    }
}
