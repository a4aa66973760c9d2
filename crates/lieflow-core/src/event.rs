use crate::types::WorkflowEvent;

/// Broadcast of workflow progress.
///
/// The engine publishes one event per task state change, plus run start,
/// finish and cancellation. Events are notifications only: the task graph
/// stays the source of truth, so a subscriber that lags more than the
/// channel capacity behind loses the oldest events and should re-read task
/// status from the workflow instead.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Nobody listening is the normal case for headless runs
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
