//! Domain event system: observe engine progress without coupling to it.
//!
//! Components publish events as they route requests, run waves, score
//! candidates and move between loop states. Subscribers filter for what
//! they care about; publishing with no subscribers is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::task::{TaskId, TaskStatus};

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// The router picked a profile for a request
    RouteSelected {
        profile: String,
        rule: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A dependency wave was handed to the parallel executor
    WaveStarted {
        goal: String,
        wave: usize,
        tasks: usize,
        timestamp: DateTime<Utc>,
    },

    /// A task reached a final status
    TaskFinished {
        task_id: TaskId,
        status: TaskStatus,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A plan stopped executing
    PlanFinished {
        goal: String,
        outcome: String,
        timestamp: DateTime<Utc>,
    },

    /// One generate-evaluate round of a convergence loop finished
    EvaluationRound {
        iteration: u32,
        aggregate: f64,
        timestamp: DateTime<Utc>,
    },

    /// The autonomous loop moved between states
    LoopTransition {
        from: String,
        to: String,
        event: String,
        timestamp: DateTime<Utc>,
    },

    /// The autonomous loop executed an action
    ActionExecuted {
        kind: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
