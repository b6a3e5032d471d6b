//! Subscription handles returned by the dispatcher.
//!
//! A listener can be created before its first event arrives and yields zero or
//! more intermediate events followed by one terminal event. One-shot listeners
//! end after the terminal event; persistent ones keep yielding until dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::dispatch::{DispatchEvent, Registry};
use crate::error::ListenerError;

#[must_use = "listeners do nothing unless polled"]
pub struct Listener {
    subscription_id: u64,
    persistent: bool,
    finished: bool,
    rx: mpsc::UnboundedReceiver<DispatchEvent>,
    registry: Weak<Registry>,
}

impl Listener {
    pub(crate) fn new(
        subscription_id: u64,
        persistent: bool,
        rx: mpsc::UnboundedReceiver<DispatchEvent>,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            subscription_id,
            persistent,
            finished: false,
            rx,
            registry,
        }
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn observe(&mut self, event: &DispatchEvent) {
        if !self.persistent && event.event_type.is_terminal() {
            self.finished = true;
        }
    }

    pub async fn next_event(&mut self) -> Option<DispatchEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// Waits for the terminal event.
    ///
    /// Error events end the wait with [`ListenerError::Rejected`].
    pub async fn settled(mut self) -> Result<DispatchEvent, ListenerError> {
        while let Some(event) = self.next_event().await {
            if event.event_type.is_error() {
                return Err(ListenerError::Rejected(Box::new(event)));
            }
            if event.event_type.is_terminal() {
                return Ok(event);
            }
        }
        Err(ListenerError::Closed)
    }

    /// Collects every event up to and including the terminal one.
    pub async fn collect_until_settled(mut self) -> Result<Vec<DispatchEvent>, ListenerError> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            if event.event_type.is_error() {
                return Err(ListenerError::Rejected(Box::new(event)));
            }
            let terminal = event.event_type.is_terminal();
            events.push(event);
            if terminal {
                return Ok(events);
            }
        }
        Err(ListenerError::Closed)
    }

    /// Settles this listener, then lets `next` hand the chain over to another listener.
    pub async fn delegate<F, Fut>(self, next: F) -> Result<DispatchEvent, ListenerError>
    where
        F: FnOnce(DispatchEvent) -> Fut,
        Fut: Future<Output = Option<Listener>>,
    {
        let event = self.settled().await?;
        match next(event.clone()).await {
            Some(listener) => listener.settled().await,
            None => Ok(event),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.subscription_id);
        }
    }
}

impl Stream for Listener {
    type Item = DispatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                self.observe(&event);
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}
