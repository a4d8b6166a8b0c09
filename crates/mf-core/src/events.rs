//! Pipeline event bus.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that progress reporters attached late can
//! still catch up.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;

use crate::ids::FileId;

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 256;

/// Payload describing what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RunStarted {
        file_id: FileId,
        path: String,
    },
    StepStarted {
        file_id: FileId,
        step: String,
        attempt: u32,
    },
    StepFinished {
        file_id: FileId,
        step: String,
        /// "success", "failed" or "skipped".
        status: String,
        error: Option<String>,
    },
    RunFinished {
        file_id: FileId,
        /// "success", "partial" or "failed".
        status: String,
    },
}

impl EventPayload {
    pub fn file_id(&self) -> FileId {
        match self {
            EventPayload::RunStarted { file_id, .. }
            | EventPayload::StepStarted { file_id, .. }
            | EventPayload::StepFinished { file_id, .. }
            | EventPayload::RunFinished { file_id, .. } => *file_id,
        }
    }
}

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` controls the broadcast channel buffer size (not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`]).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn publish(&self, payload: EventPayload) {
        let event = Event {
            timestamp: Utc::now(),
            payload,
        };

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.recent.read().iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let file_id = FileId::new();
        bus.publish(EventPayload::StepStarted {
            file_id,
            step: "checksum".into(),
            attempt: 1,
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload.file_id(), file_id);
        match event.payload {
            EventPayload::StepStarted { step, attempt, .. } => {
                assert_eq!(step, "checksum");
                assert_eq!(attempt, 1);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn recent_events_capped() {
        let bus = EventBus::default();
        let file_id = FileId::new();
        for _ in 0..300 {
            bus.publish(EventPayload::RunFinished {
                file_id,
                status: "success".into(),
            });
        }
        assert_eq!(bus.recent_events(1000).len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.publish(EventPayload::RunStarted {
            file_id: FileId::new(),
            path: "/media/a.mov".into(),
        });
        assert_eq!(bus.recent_events(10).len(), 1);
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = EventPayload::RunFinished {
            file_id: FileId::new(),
            status: "partial".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "run_finished");
        assert_eq!(json["status"], "partial");
    }
}
