//! Broadcast bus carrying `EngineEvent`s to any number of observers.

use millrace_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for run and step lifecycle events.
///
/// Cloning shares the channel. Slow subscribers lag and skip events rather
/// than back-pressuring the engine.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// A receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers; dropped when there are none.
    pub fn publish(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("engine event dropped, no subscribers");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_types::run::RunStatus;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_subscribers_see_run_lifecycle_in_order() {
        let bus = EventBus::new(16);
        let mut observer = bus.subscribe();
        let mut auditor = bus.subscribe();
        let run_id = Uuid::now_v7();

        bus.publish(EngineEvent::RunStarted {
            run_id,
            flow: "digest".to_string(),
        });
        bus.publish(EngineEvent::RunFinished {
            run_id,
            status: RunStatus::Succeeded,
            error: None,
        });

        for rx in [&mut observer, &mut auditor] {
            assert!(matches!(rx.recv().await.unwrap(), EngineEvent::RunStarted { .. }));
            assert!(matches!(
                rx.recv().await.unwrap(),
                EngineEvent::RunFinished { status: RunStatus::Succeeded, .. }
            ));
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.receiver_count(), 0);
        bus.publish(EngineEvent::StepSkipped {
            run_id: Uuid::now_v7(),
            step: "a".to_string(),
        });
    }

    #[test]
    fn test_slow_subscriber_lags() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        let run_id = Uuid::now_v7();
        for attempt in 1..=5 {
            bus.publish(EngineEvent::StepStarted {
                run_id,
                step: "fetch".to_string(),
                attempt,
            });
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(3))
        ));
        match rx.try_recv().unwrap() {
            EngineEvent::StepStarted { attempt, .. } => assert_eq!(attempt, 4),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_clones_share_channel() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.clone().publish(EngineEvent::RunStarted {
            run_id: Uuid::now_v7(),
            flow: "digest".to_string(),
        });
        assert!(rx.try_recv().is_ok());
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
