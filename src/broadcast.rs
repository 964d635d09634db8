//! Bounded notification history and fan-out to every live session

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::framing::Outbound;
use crate::protocol::Event;
use crate::registry::SessionRegistry;

/// Outcome of one fan-out. Failures are reported, never raised.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<Uuid>,
}

pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>, capacity: usize) -> Self {
        Broadcaster {
            registry,
            history: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
        }
    }

    /// Remember an event, evicting the oldest beyond capacity.
    pub fn append(&self, event: Event) {
        let mut history = self.history.lock();
        history.push_back(event);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    /// Current history, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.history.lock().iter().cloned().collect()
    }

    /// History as the single batched message sent after AUTH, if any.
    pub fn replay(&self) -> Option<Event> {
        let data = self.history();
        if data.is_empty() {
            None
        } else {
            Some(Event::History { data })
        }
    }

    /// Send one event to every session registered right now. A closed or
    /// saturated queue counts as a failed delivery for that session only.
    pub fn broadcast(&self, event: &Event) -> BroadcastReport {
        let text = match serde_json::to_string(event) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to encode event");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        for handle in self.registry.snapshot() {
            match handle.outbox.try_send(Outbound::Text(text.clone())) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(session = %handle.id, "outbound queue full, event dropped");
                    report.failed.push(handle.id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = %handle.id, "session gone during broadcast");
                    report.failed.push(handle.id);
                }
            }
        }
        report
    }

    /// Record in history, then fan out.
    ///
    /// Sessions are registered from connect, not from AUTH, so a session that
    /// authenticates while this runs can see the event twice: once live and
    /// once inside its HISTORY batch. Never zero times. Clients that care
    /// dedupe on `(filename, uploader)`.
    pub fn publish(&self, event: Event) -> BroadcastReport {
        self.append(event.clone());
        self.broadcast(&event)
    }
}
