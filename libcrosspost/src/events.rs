//! Event system for posting progress
//!
//! This module provides an in-process event bus for distributing status
//! changes to subscribers without blocking the scheduler.
//!
//! # Architecture
//!
//! The event bus uses `tokio::sync::broadcast` for multi-subscriber support.
//! Events are emitted by the queue and the scheduler and can be consumed by
//! any number of subscribers (the daemon's JSON output, a status view, tests).
//!
//! # Delivery
//!
//! If no subscribers exist, events are dropped immediately. Subscribers can
//! lag without blocking emitters; a lagging subscriber loses the oldest
//! events, so consumers should treat every event as idempotent and re-query
//! `Orchestrator::statuses()` when they need the full picture.
//!
//! # Example
//!
//! ```no_run
//! use libcrosspost::events::{Event, EventBus};
//!
//! # async fn example() {
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(Event::SubmissionQueued {
//!     submission_id: "abc123".to_string(),
//!     destinations: vec!["gallery".to_string()],
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{PostInfoStatus, PostState};

/// Event receiver type alias
pub type EventReceiver = broadcast::Receiver<Event>;

/// Event bus for distributing posting events
///
/// Cloning the bus is cheap; all clones feed the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a new event bus with the specified capacity
    ///
    /// The capacity determines how many events can be buffered per subscriber
    /// before older events are dropped (if the subscriber is lagging).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Never blocks and never fails. Without subscribers the event is dropped.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Events emitted while submissions move through the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A submission entered the queue
    SubmissionQueued {
        submission_id: String,
        destinations: Vec<String>,
    },

    /// The status of one (submission, destination) pair changed
    PairStatusChanged {
        submission_id: String,
        status: PostInfoStatus,
    },

    /// Every pair reached a terminal state
    SubmissionCompleted {
        submission_id: String,
        results: Vec<PairResult>,
    },

    /// The submission was cancelled before it completed
    SubmissionCancelled { submission_id: String },
}

impl Event {
    pub fn submission_id(&self) -> &str {
        match self {
            Event::SubmissionQueued { submission_id, .. }
            | Event::PairStatusChanged { submission_id, .. }
            | Event::SubmissionCompleted { submission_id, .. }
            | Event::SubmissionCancelled { submission_id } => submission_id,
        }
    }
}

/// Final outcome of a single pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairResult {
    pub destination: String,
    pub status: PostState,
    pub attempts: u32,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl From<&PostInfoStatus> for PairResult {
    fn from(status: &PostInfoStatus) -> Self {
        Self {
            destination: status.destination.clone(),
            status: status.status,
            attempts: status.attempts,
            message: status.message.clone(),
            error: status.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_emission_and_subscription() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.emit(Event::SubmissionQueued {
            submission_id: "test123".to_string(),
            destinations: vec!["gallery".to_string()],
        });

        match receiver.recv().await.unwrap() {
            Event::SubmissionQueued {
                submission_id,
                destinations,
            } => {
                assert_eq!(submission_id, "test123");
                assert_eq!(destinations, vec!["gallery"]);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        event_bus.emit(Event::SubmissionCancelled {
            submission_id: "test456".to_string(),
        });

        assert_eq!(receiver1.recv().await.unwrap().submission_id(), "test456");
        assert_eq!(receiver2.recv().await.unwrap().submission_id(), "test456");
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let event_bus = EventBus::new(10);

        // Emitting with nobody listening must not panic or block
        event_bus.emit(Event::SubmissionCancelled {
            submission_id: "test789".to_string(),
        });

        assert_eq!(event_bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_does_not_block() {
        let event_bus = EventBus::new(2);
        let mut receiver = event_bus.subscribe();

        for i in 0..5 {
            event_bus.emit(Event::SubmissionCancelled {
                submission_id: i.to_string(),
            });
        }

        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(receiver.recv().await.unwrap().submission_id(), "3");
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::SubmissionCompleted {
            submission_id: "serial_test".to_string(),
            results: vec![PairResult {
                destination: "gallery".to_string(),
                status: PostState::Error,
                attempts: 3,
                message: None,
                error: Some("Network timeout".to_string()),
            }],
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"submission_completed\""));
        assert!(json.contains("\"status\":\"ERROR\""));
        assert!(json.contains("Network timeout"));

        let deserialized: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[test]
    fn test_pair_result_from_status() {
        let mut status = PostInfoStatus::queued("booru", None);
        status.status = PostState::Success;
        status.attempts = 2;
        status.message = Some("posted".to_string());

        let result = PairResult::from(&status);
        assert_eq!(result.destination, "booru");
        assert_eq!(result.status, PostState::Success);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.message.as_deref(), Some("posted"));
    }
}
