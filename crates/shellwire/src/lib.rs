//! Client-side request multiplexing for the shell GUI backend.
//!
//! ```text
//! caller --send_request--> MessageScheduler --frames--> Transport --> backend
//!                               |    ^
//!             pending records --+    +-- reader task classifies every frame
//!                               |
//!                               +--> Dispatcher (id / class listeners)
//!                               +--> RequisitionHub (named signals, host bridge)
//! ```
//!
//! One [`MessageScheduler`] owns one socket. Each request gets a correlation
//! id and a pending record; the reader task routes every response frame to
//! its record and resolves the caller once a terminal frame arrives.
//! Connection changes and session bootstrap are announced on the
//! [`RequisitionHub`], and every frame is mirrored to the [`Dispatcher`].

pub mod bus;
pub mod config;
pub mod debugger;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod matcher;
pub mod scheduler;
pub mod transport;

pub use bus::{Callback, RequisitionHub, callback, signals};
pub use debugger::{CommunicationDebugger, DebuggerConfig, ValidationOutcome};
pub use dispatch::{DispatchContext, DispatchEvent, Dispatcher, EventFilter, EventType, Subscription};
pub use error::{ListenerError, ResponseError, SchedulerError, SchedulerResult, TransportError};
pub use listener::Listener;
pub use scheduler::{
    ConnectTarget, ConnectionPhase, MessageScheduler, RequestDetails, ResponsePayload, SchedulerConfig,
};
pub use transport::{MemoryTransport, TransportFactory, WebSocketFactory};

pub use shellwire_protocol as protocol;
