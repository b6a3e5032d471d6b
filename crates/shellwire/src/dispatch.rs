//! Id- and class-correlated event dispatch.
//!
//! Every inbound response frame and every raw outbound request is also
//! published here. Subscribers pick events by request id, by message class,
//! or take everything. The communication debugger is the main consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{debug, trace};
use serde_json::Value;
use shellwire_protocol::ResponseClass;
use tokio::sync::mpsc;

use crate::listener::Listener;

/// Kind of a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Request,
    StartResponse,
    DataResponse,
    EndResponse,
    FinalResponse,
    ErrorResponse,
    CancelResponse,
    Notification,
    Unknown,
}

impl EventType {
    /// Terminal events retire one-shot subscriptions and the request's context.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FinalResponse | Self::ErrorResponse | Self::CancelResponse | Self::Notification
        )
    }

    pub fn is_error(self) -> bool {
        self == Self::ErrorResponse
    }
}

impl From<ResponseClass> for EventType {
    fn from(class: ResponseClass) -> Self {
        match class {
            ResponseClass::Start => Self::StartResponse,
            ResponseClass::Data => Self::DataResponse,
            ResponseClass::End => Self::EndResponse,
            ResponseClass::Final => Self::FinalResponse,
            ResponseClass::Error => Self::ErrorResponse,
            ResponseClass::Cancel => Self::CancelResponse,
            ResponseClass::Unknown => Self::Unknown,
        }
    }
}

/// Context remembered for a request id between its events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchContext {
    pub message_class: String,
}

impl DispatchContext {
    pub fn new(message_class: impl Into<String>) -> Self {
        Self {
            message_class: message_class.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub id: Option<String>,
    pub event_type: EventType,
    pub message: String,
    /// Payload in application casing.
    pub data: Value,
    /// The frame exactly as it crossed the wire.
    pub raw: Value,
    pub context: DispatchContext,
}

impl DispatchEvent {
    pub fn notification(message_class: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            event_type: EventType::Notification,
            message: String::new(),
            raw: data.clone(),
            data,
            context: DispatchContext::new(message_class),
        }
    }

    pub fn request(id: impl Into<String>, frame: Value) -> Self {
        Self {
            id: Some(id.into()),
            event_type: EventType::Request,
            message: String::new(),
            raw: frame.clone(),
            data: frame,
            context: DispatchContext::default(),
        }
    }

    pub fn response(id: Option<String>, class: ResponseClass, message: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            event_type: class.into(),
            message: message.into(),
            raw: data.clone(),
            data,
            context: DispatchContext::new("serverResponse"),
        }
    }

    /// Replaces the wire frame, for events whose `data` was re-cased.
    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }
}

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    RequestId(String),
    MessageClass(String),
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub filter: EventFilter,
    /// Persistent subscriptions survive terminal events.
    pub persistent: bool,
    /// Skip `Request` events (outbound echoes).
    pub skip_requests: bool,
}

impl Subscription {
    pub fn all() -> Self {
        Self::new(EventFilter::All)
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new(EventFilter::RequestId(id.into()))
    }

    pub fn by_class(message_class: impl Into<String>) -> Self {
        Self::new(EventFilter::MessageClass(message_class.into()))
    }

    fn new(filter: EventFilter) -> Self {
        Self {
            filter,
            persistent: false,
            skip_requests: false,
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn skip_requests(mut self) -> Self {
        self.skip_requests = true;
        self
    }

    fn matches(&self, event: &DispatchEvent) -> bool {
        if self.skip_requests && event.event_type == EventType::Request {
            return false;
        }
        match &self.filter {
            EventFilter::All => true,
            EventFilter::RequestId(id) => event.id.as_deref() == Some(id.as_str()),
            EventFilter::MessageClass(class) => &event.context.message_class == class,
        }
    }
}

pub(crate) struct Entry {
    subscription: Subscription,
    tx: mpsc::UnboundedSender<DispatchEvent>,
}

/// Subscription table shared with the listeners, which remove themselves on drop.
pub(crate) type Registry = DashMap<u64, Entry>;

pub struct Dispatcher {
    subscriptions: Arc<Registry>,
    contexts: DashMap<String, DispatchContext>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            contexts: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, subscription: Subscription) -> Listener {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let persistent = subscription.persistent;
        trace!("dispatcher subscription {id}: {:?}", subscription.filter);
        self.subscriptions.insert(id, Entry { subscription, tx });
        Listener::new(id, persistent, rx, Arc::downgrade(&self.subscriptions))
    }

    /// Removes a subscription. Dropping the listener does the same.
    pub fn unsubscribe(&self, listener: &Listener) {
        self.subscriptions.remove(&listener.subscription_id());
    }

    /// Remembers the context of a request so later events with that id carry it.
    pub fn map_message_context(&self, id: impl Into<String>, context: DispatchContext) {
        self.contexts.insert(id.into(), context);
    }

    /// Forgets the context of a request that will not see a terminal event.
    pub fn forget_message_context(&self, id: &str) {
        self.contexts.remove(id);
    }

    pub fn context(&self, id: &str) -> Option<DispatchContext> {
        self.contexts.get(id).map(|c| c.clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Delivers `event` to every matching subscription and returns how many received it.
    pub fn trigger_event(&self, mut event: DispatchEvent) -> usize {
        if let Some(context) = event.id.as_deref().and_then(|id| self.context(id)) {
            event.context = context;
        }

        let terminal = event.event_type.is_terminal();
        let mut delivered = 0;
        let mut retired = Vec::new();

        for entry in self.subscriptions.iter() {
            if !entry.subscription.matches(&event) {
                continue;
            }
            if entry.tx.send(event.clone()).is_err() {
                retired.push(*entry.key());
                continue;
            }
            delivered += 1;
            if terminal && !entry.subscription.persistent {
                retired.push(*entry.key());
            }
        }

        // Removal happens after the iteration released its shard guards.
        for id in retired {
            self.subscriptions.remove(&id);
        }

        if terminal && let Some(id) = &event.id {
            self.contexts.remove(id);
        }

        debug!(
            "dispatched {:?} (id {:?}) to {delivered} subscriber(s)",
            event.event_type, event.id
        );
        delivered
    }

    pub fn trigger_notification(&self, message_class: &str, data: Value) -> usize {
        self.trigger_event(DispatchEvent::notification(message_class, data))
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
