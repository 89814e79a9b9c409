//! Task events published to subscribers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::{DownloadProgress, DownloadTask, TaskError};

/// Lifecycle and progress events of tasks.
///
/// Delivery is best effort: a lagging subscriber loses the oldest events
/// and should re-fetch task state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Queued { task_id: String },
    Started { task_id: String },
    Progress {
        task_id: String,
        progress: DownloadProgress,
    },
    Paused { task_id: String },
    Resumed { task_id: String },
    Canceled { task_id: String },
    Completed {
        task_id: String,
        task: Box<DownloadTask>,
    },
    Error { task_id: String, error: TaskError },
    Removed { task_id: String },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Queued { task_id }
            | Self::Started { task_id }
            | Self::Progress { task_id, .. }
            | Self::Paused { task_id }
            | Self::Resumed { task_id }
            | Self::Canceled { task_id }
            | Self::Completed { task_id, .. }
            | Self::Error { task_id, .. }
            | Self::Removed { task_id } => task_id,
        }
    }

    /// Short name of the event, as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::Canceled { .. } => "canceled",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Removed { .. } => "removed",
        }
    }
}

/// Broadcast publisher of [`TaskEvent`]s.
#[derive(Debug, Clone)]
pub struct TaskEventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl TaskEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TaskEvent) {
        if !matches!(event, TaskEvent::Progress { .. }) {
            trace!(task_id = %event.task_id(), event = event.name(), "Publishing task event");
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = TaskEventBus::new(8);
        bus.publish(TaskEvent::Queued {
            task_id: "lost".into(),
        });

        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(TaskEvent::Started {
            task_id: "t1".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id(), "t1");
        assert_eq!(event.name(), "started");
    }

    #[tokio::test]
    async fn test_lagging_subscriber_loses_oldest() {
        let bus = TaskEventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..4 {
            bus.publish(TaskEvent::Paused {
                task_id: i.to_string(),
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(rx.recv().await.unwrap().task_id(), "2");
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(TaskEvent::Canceled {
            task_id: "t1".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "canceled", "task_id": "t1"}));
    }
}
