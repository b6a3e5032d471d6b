#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};
use shellwire::bus::{self, RequisitionHub};
use shellwire::transport::{MemoryPeer, MemoryServer, MemoryTransport};
use shellwire::{ConnectTarget, Dispatcher, MessageScheduler, SchedulerConfig};
use tokio::sync::mpsc;
use url::Url;

pub struct Harness {
    pub scheduler: MessageScheduler,
    pub hub: Arc<RequisitionHub>,
    pub dispatcher: Arc<Dispatcher>,
    pub transport: Arc<MemoryTransport>,
    pub server: MemoryServer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let (transport, server) = MemoryTransport::new();
        let hub = Arc::new(RequisitionHub::new("test"));
        let dispatcher = Arc::new(Dispatcher::new());
        let scheduler = MessageScheduler::new(config, transport.clone(), hub.clone(), dispatcher.clone());
        Self {
            scheduler,
            hub,
            dispatcher,
            transport,
            server,
        }
    }

    pub fn target() -> ConnectTarget {
        ConnectTarget::new(Url::parse("http://localhost:8000/").unwrap())
    }

    /// Connects and returns the backend end of the new socket.
    pub async fn connect(&mut self) -> MemoryPeer {
        self.scheduler.connect(&Self::target()).await.unwrap();
        self.server.accept().await.unwrap()
    }

    /// Records every payload published for `signal`.
    pub fn record(&self, signal: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.register(
            signal,
            bus::callback(move |payload| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload);
                    Ok(true)
                }
            }),
        );
        rx
    }
}

pub fn started(id: &str) -> Value {
    json!({"request_id": id, "request_state": {"type": "PENDING", "msg": "Execution started..."}})
}

pub fn data(id: &str, result: Value) -> Value {
    json!({"request_id": id, "request_state": {"type": "PENDING", "msg": ""}, "result": result})
}

pub fn end(id: &str, result: Value) -> Value {
    json!({"request_id": id, "request_state": {"type": "OK", "msg": ""}, "result": result})
}

pub fn done(id: &str, result: Option<Value>) -> Value {
    let mut frame = json!({"request_id": id, "request_state": {"type": "OK", "msg": ""}, "done": true});
    if let Some(result) = result {
        frame["result"] = result;
    }
    frame
}

pub fn error(id: &str, msg: &str) -> Value {
    json!({"request_id": id, "request_state": {"type": "ERROR", "msg": msg}})
}

pub fn cancelled(id: &str) -> Value {
    json!({"request_id": id, "request_state": {"type": "CANCELLED", "msg": "Request cancelled."}})
}

/// Reads the next client frame and returns it with its request id.
pub async fn next_request(peer: &mut MemoryPeer) -> (String, Value) {
    let frame = peer.recv_json().await.expect("client closed the socket");
    let id = frame["request_id"].as_str().expect("frame without request_id").to_string();
    (id, frame)
}
