//! Progress events published by the orchestrator.

use std::fmt;
use tokio::sync::broadcast;

use crate::model::PartialResult;

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// Per-entity processing state.
///
/// ```text
/// NotStarted -> TablesResolved -> TablesChecked -> Extracting -> Merging -> Complete
///      \
///       `-> EntityFailed (target fetch failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    NotStarted,
    TablesResolved,
    TablesChecked,
    Extracting,
    Merging,
    Complete,
    EntityFailed,
}

impl EntityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityState::NotStarted => "not-started",
            EntityState::TablesResolved => "tables-resolved",
            EntityState::TablesChecked => "tables-checked",
            EntityState::Extracting => "extracting",
            EntityState::Merging => "merging",
            EntityState::Complete => "complete",
            EntityState::EntityFailed => "entity-failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EntityState::Complete | EntityState::EntityFailed)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured progress event.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged {
        entity: String,
        from: EntityState,
        to: EntityState,
    },
    TableFinished {
        entity: String,
        result: PartialResult,
    },
    MergeBatch {
        entity: String,
        /// 1-based batch number.
        batch: usize,
        batches: usize,
        joined: usize,
    },
    EntityFinished {
        entity: String,
        state: EntityState,
        cost_usd: f64,
    },
}

/// Broadcast channel for [`PipelineEvent`]s. Publishing never blocks and
/// succeeds with no subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        bus.publish(PipelineEvent::MergeBatch {
            entity: "lost".into(),
            batch: 1,
            batches: 1,
            joined: 0,
        });

        let mut rx = bus.subscribe();
        let event = PipelineEvent::StateChanged {
            entity: "eurusd".into(),
            from: EntityState::NotStarted,
            to: EntityState::TablesResolved,
        };
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_terminal_states() {
        assert!(EntityState::Complete.is_terminal());
        assert!(EntityState::EntityFailed.is_terminal());
        assert!(!EntityState::Merging.is_terminal());
        assert_eq!(EntityState::TablesChecked.to_string(), "tables-checked");
    }
}
