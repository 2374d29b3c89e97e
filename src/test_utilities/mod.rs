pub mod mock_device;
pub mod test_manager;

pub use test_manager::TestManager;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use crate::device::Device;
use crate::ota::state::UploadState;
use crate::ota::task::{TransferSettings, UploadTask};
use crate::progress::{ProgressEvent, ProgressSink};

/// Transfer settings short enough for failure paths to finish quickly.
pub fn fast_settings() -> TransferSettings {
    TransferSettings {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        invitation_timeout: Duration::from_millis(400),
        accept_timeout: Duration::from_secs(2),
        ack_timeout: Duration::from_secs(2),
        confirmation_window: Duration::from_secs(1),
    }
}

pub fn loopback_device(id: &str, board: &str) -> Device {
    Device::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), board)
}

/// Sink keeping every event it receives.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, task_id: Uuid) -> Vec<ProgressEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.task_id == task_id)
            .collect()
    }

    /// State transitions of one task, in order.
    pub fn states_for(&self, task_id: Uuid) -> Vec<UploadState> {
        self.events_for(task_id)
            .into_iter()
            .filter(|event| event.progress.is_none())
            .map(|event| event.status)
            .collect()
    }

    pub fn progress_for(&self, task_id: Uuid) -> Vec<u8> {
        self.events_for(task_id)
            .into_iter()
            .filter_map(|event| event.progress)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn publish(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub async fn wait_for_state(task: &UploadTask, state: UploadState) {
    timeout(Duration::from_secs(5), async {
        while task.state() != state {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task never reached {}, stuck in {}", state, task.state()));
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}
