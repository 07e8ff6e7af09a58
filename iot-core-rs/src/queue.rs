//! Bounded FIFO event queue
//!
//! Many producers, one consumer. Producers wait at most `enqueue_wait` for
//! space and report failure instead of blocking the device.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tracing::warn;

use crate::types::Event;

/// Queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Event queue full, dropped {0}")]
    Full(&'static str),

    #[error("Event queue closed")]
    Closed,
}

/// Create a queue holding at most `capacity` events
pub fn event_queue(capacity: usize, enqueue_wait: Duration) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx, enqueue_wait }, EventReceiver { rx })
}

/// Producer side of the queue
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    enqueue_wait: Duration,
}

impl EventSender {
    /// Enqueue with a bounded wait
    pub async fn submit(&self, event: Event) -> Result<(), QueueError> {
        self.tx
            .send_timeout(event, self.enqueue_wait)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(event) => {
                    warn!("Queue: Full, dropping {}", event.kind());
                    QueueError::Full(event.kind())
                }
                SendTimeoutError::Closed(_) => QueueError::Closed,
            })
    }

    /// Enqueue without waiting, for driver callbacks
    pub fn try_submit(&self, event: Event) -> Result<(), QueueError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(event) => {
                warn!("Queue: Full, dropping {}", event.kind());
                QueueError::Full(event.kind())
            }
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Events waiting to be consumed
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn max_capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Consumer side of the queue
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<Event>,
}

impl EventReceiver {
    /// Next event, or `None` if nothing arrived within `poll`
    pub async fn recv_timeout(&mut self, poll: Duration) -> Option<Event> {
        match tokio::time::timeout(poll, self.rx.recv()).await {
            Ok(event) => event,
            Err(_) => None,
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
