use chrono::Utc;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::events::{OrchestrationEvent, StreamEvent, EVENT_VERSION};
use crate::config::StreamConfig;
use crate::model::SessionId;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
}

struct StreamerInner {
    next_sequence: u64,
    next_subscriber: u64,
    subscribers: Vec<Subscriber>,
    history: VecDeque<StreamEvent>,
    closed: bool,
}

/// Per-session event fan-out with bounded subscriber buffers
///
/// Sequence assignment, history and delivery share one lock, so every
/// subscriber sees events in sequence order. Producers never wait: a
/// subscriber whose buffer is full is dropped.
pub struct EventStreamer {
    session_id: SessionId,
    subscriber_capacity: usize,
    history_capacity: usize,
    inner: Mutex<StreamerInner>,
}

impl EventStreamer {
    pub fn new(session_id: SessionId, config: &StreamConfig) -> Self {
        Self {
            session_id,
            subscriber_capacity: config.subscriber_capacity.max(1),
            history_capacity: config.history_capacity,
            inner: Mutex::new(StreamerInner {
                next_sequence: 1,
                next_subscriber: 0,
                subscribers: Vec::new(),
                history: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Publish an event; returns its sequence, or `None` once the stream is closed
    pub fn publish(&self, event: OrchestrationEvent) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            debug!(
                session_id = %self.session_id,
                kind = event.kind(),
                "Stream closed, event dropped"
            );
            return None;
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let terminal = event.is_terminal();
        let envelope = StreamEvent {
            version: EVENT_VERSION,
            session_id: self.session_id,
            sequence,
            timestamp: Utc::now(),
            event,
        };

        if self.history_capacity > 0 {
            if inner.history.len() == self.history_capacity {
                inner.history.pop_front();
            }
            inner.history.push_back(envelope.clone());
        }

        let session_id = self.session_id;
        inner.subscribers.retain(|sub| match sub.tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    session_id = %session_id,
                    subscriber = sub.id,
                    sequence,
                    "Subscriber buffer full, disconnecting"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %session_id, subscriber = sub.id, "Subscriber gone");
                false
            }
        });

        if terminal {
            inner.closed = true;
            // dropping the senders ends every subscriber stream
            inner.subscribers.clear();
        }
        Some(sequence)
    }

    /// Subscribe with replay of the retained history
    pub fn subscribe(&self) -> EventSubscription {
        let mut inner = self.inner.lock();
        let (tx, rx) = mpsc::channel(self.subscriber_capacity + inner.history.len());
        for event in &inner.history {
            // capacity covers the whole history
            let _ = tx.try_send(event.clone());
        }
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        if !inner.closed {
            inner.subscribers.push(Subscriber { id, tx });
        }
        debug!(
            session_id = %self.session_id,
            subscriber = id,
            replayed = inner.history.len(),
            "Subscriber attached"
        );
        EventSubscription {
            inner: ReceiverStream::new(rx),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn history(&self) -> Vec<StreamEvent> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// A subscriber's view of the stream; ends after `OrchestrationCompleted`
pub struct EventSubscription {
    inner: ReceiverStream<StreamEvent>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.inner.next().await
    }

    /// Drain every remaining event until the stream ends
    pub async fn collect_all(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for EventSubscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
