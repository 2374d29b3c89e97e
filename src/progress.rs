use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::ota::state::UploadState;

///
/// What an upload task pushes out on every state change and progress
/// update. `progress` is `None` for pure state transitions.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub status: UploadState,
    pub progress: Option<u8>,
}

impl ProgressEvent {
    pub fn state(task_id: Uuid, status: UploadState) -> Self {
        ProgressEvent {
            task_id,
            status,
            progress: None,
        }
    }

    pub fn progress(task_id: Uuid, status: UploadState, progress: u8) -> Self {
        ProgressEvent {
            task_id,
            status,
            progress: Some(progress),
        }
    }
}

///
/// Destination of progress events.
///
/// Delivery is best-effort. Implementations swallow their own failures,
/// a task never changes course because an event could not be delivered.
///
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Fans events out over a tokio broadcast channel.
#[derive(Clone, Debug)]
pub struct BroadcastProgressSink {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgressSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        BroadcastProgressSink { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressSink for BroadcastProgressSink {
    fn publish(&self, event: ProgressEvent) {
        if let Err(err) = self.sender.send(event) {
            debug!("progress event for {} dropped: no subscribers", err.0.task_id);
        }
    }
}
