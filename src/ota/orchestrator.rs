use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::boards::BoardRegistry;
use crate::catalog::FirmwareCatalog;
use crate::device::{Device, DeviceDirectory, DeviceKey};
use crate::error::{OtaError, OtaResult};
use crate::firmware::{md5_hex_blocking, FirmwareInfo};
use crate::ota::state::UploadState;
use crate::ota::task::{TransferSettings, UploadTask};
use crate::progress::{ProgressEvent, ProgressSink};

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A dispatched upload and the handle of the worker running it.
#[derive(Debug)]
struct ActiveUpload {
    handle: JoinHandle<()>,
    task: Arc<UploadTask>,
}

impl ActiveUpload {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Whether the entry still blocks new uploads to its device.
    fn is_running(&self) -> bool {
        !self.is_finished() && !self.task.state().is_terminal()
    }
}

pub type ActiveUploads = Arc<RwLock<HashMap<DeviceKey, ActiveUpload>>>;

/// Row of `list_running_uploads`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningUpload {
    pub task_id: Uuid,
    pub device: Device,
    pub firmware: FirmwareInfo,
    pub state: UploadState,
    pub progress: u8,
    pub started_at: u64,
}

impl RunningUpload {
    fn of(task: &UploadTask) -> Self {
        RunningUpload {
            task_id: task.id(),
            device: task.device().clone(),
            firmware: task.firmware().clone(),
            state: task.state(),
            progress: task.progress(),
            started_at: task.started_at(),
        }
    }
}

///
/// The `UploadOrchestrator` validates upload requests and runs the
/// resulting `UploadTask`s.
///
/// Every request is checked completely before anything is spawned: the
/// device must be known and live, its board supported, the firmware
/// present with an intact binary, and built for the device's board. A
/// device runs at most one upload at a time. Tasks wait for one of a
/// fixed number of worker slots before they touch the network.
///
pub struct UploadOrchestrator {
    catalog_lock: Arc<RwLock<FirmwareCatalog>>,
    directory: Arc<dyn DeviceDirectory>,
    boards: BoardRegistry,
    sink: Arc<dyn ProgressSink>,
    transfer: TransferSettings,
    workers: Arc<Semaphore>,
    uploads: ActiveUploads,
}

impl UploadOrchestrator {
    pub fn new(
        catalog_lock: Arc<RwLock<FirmwareCatalog>>,
        directory: Arc<dyn DeviceDirectory>,
        boards: BoardRegistry,
        sink: Arc<dyn ProgressSink>,
        transfer: TransferSettings,
        workers: usize,
    ) -> Self {
        UploadOrchestrator {
            catalog_lock,
            directory,
            boards,
            sink,
            transfer,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            uploads: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn boards(&self) -> &BoardRegistry {
        &self.boards
    }

    ///
    /// Starts uploading firmware `firmware_id` to the device matching
    /// `device_ref` and returns the id of the new task without waiting
    /// for the transfer.
    ///
    pub async fn upload_firmware(&self, firmware_id: Uuid, device_ref: &str) -> OtaResult<Uuid> {
        let device = self
            .directory
            .resolve(device_ref)
            .ok_or_else(|| OtaError::NotFound(format!("device {}", device_ref.trim())))?;
        let key = device.key();
        self.ensure_idle(&key).await?;

        let invitation_port = self.boards.port_for(&device.board)?;
        let (firmware, image) = self.load_verified(firmware_id).await?;
        if !firmware.board.trim().eq_ignore_ascii_case(device.board.trim()) {
            return Err(OtaError::BoardMismatch {
                firmware: firmware.board,
                device: device.board,
            });
        }

        let task = Arc::new(UploadTask::new(firmware, device, invitation_port, image));
        let task_id = task.id();
        {
            let mut uploads = self.uploads.write().await;
            if let Some(active) = uploads.get(&key) {
                if active.is_running() {
                    return Err(OtaError::Conflict(format!(
                        "device {} is already running upload {}",
                        key,
                        active.task.id()
                    )));
                }
            }
            self.sink
                .publish(ProgressEvent::state(task_id, UploadState::Started));
            let handle = tokio::spawn(work(
                task.clone(),
                self.workers.clone(),
                self.sink.clone(),
                self.transfer.clone(),
            ));
            // replaces a terminal entry for the same device, if any
            uploads.insert(key.clone(), ActiveUpload { handle, task });
        }
        info!(
            "dispatched upload {} of firmware {} to {}",
            task_id, firmware_id, key
        );
        Ok(task_id)
    }

    ///
    /// Starts the same firmware on several devices. Results are keyed by
    /// device key, or by the trimmed selector when it names no device.
    /// Selectors naming the same device collapse into one upload. Each
    /// device is handled on its own: a failure is reported under its key
    /// and does not affect the others.
    ///
    pub async fn upload_firmware_batch(
        &self,
        firmware_id: Uuid,
        devices: &[String],
    ) -> BTreeMap<String, OtaResult<Uuid>> {
        let mut targets: BTreeMap<String, &str> = BTreeMap::new();
        for device_ref in devices {
            let key = match self.directory.resolve(device_ref) {
                Some(device) => device.key().as_str().to_string(),
                None => device_ref.trim().to_string(),
            };
            if targets.contains_key(&key) {
                debug!("batch names device {} more than once", key);
                continue;
            }
            targets.insert(key, device_ref.as_str());
        }
        let uploads = targets.into_iter().map(|(key, device_ref)| async move {
            (key, self.upload_firmware(firmware_id, device_ref).await)
        });
        join_all(uploads).await.into_iter().collect()
    }

    /// Uploads still in progress. Entries whose worker has finished are
    /// evicted on the way.
    pub async fn list_running_uploads(&self) -> Vec<RunningUpload> {
        let mut uploads = self.uploads.write().await;
        uploads.retain(|_, active| !active.is_finished());
        let mut running: Vec<RunningUpload> = uploads
            .values()
            .map(|active| RunningUpload::of(&active.task))
            .collect();
        running.sort_by_key(|upload| upload.started_at);
        running
    }

    /// Requests cancellation of task `task_id`.
    pub async fn abort_upload(&self, task_id: Uuid) -> OtaResult<()> {
        let uploads = self.uploads.read().await;
        let active = uploads
            .values()
            .find(|active| active.task.id() == task_id)
            .ok_or_else(|| OtaError::NotFound(format!("upload {}", task_id)))?;
        info!("abort requested for upload {} to {}", task_id, active.task.device_key());
        active.task.abort();
        Ok(())
    }

    /// Current state of task `task_id`, while it is still registered.
    pub async fn upload_state(&self, task_id: Uuid) -> Option<UploadState> {
        self.uploads
            .read()
            .await
            .values()
            .find(|active| active.task.id() == task_id)
            .map(|active| active.task.state())
    }

    /// Removes entries whose worker has finished. Returns how many went.
    pub async fn sweep(&self) -> usize {
        let mut uploads = self.uploads.write().await;
        let before = uploads.len();
        uploads.retain(|_, active| !active.is_finished());
        let evicted = before - uploads.len();
        if evicted > 0 {
            debug!("swept {} finished uploads", evicted);
        }
        evicted
    }

    /// Spawns the periodic sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                orchestrator.sweep().await;
            }
        })
    }

    async fn ensure_idle(&self, key: &DeviceKey) -> OtaResult<()> {
        let uploads = self.uploads.read().await;
        match uploads.get(key) {
            Some(active) if active.is_running() => Err(OtaError::Conflict(format!(
                "device {} is already running upload {}",
                key,
                active.task.id()
            ))),
            _ => Ok(()),
        }
    }

    /// Loads firmware metadata and binary, refusing a binary whose checksum
    /// no longer matches the catalog.
    async fn load_verified(&self, firmware_id: Uuid) -> OtaResult<(FirmwareInfo, Vec<u8>)> {
        let (firmware, path) = {
            let catalog = self.catalog_lock.read().await;
            let firmware = catalog
                .get(firmware_id)
                .ok_or_else(|| OtaError::NotFound(format!("firmware {}", firmware_id)))?;
            let path = catalog
                .blobs()
                .read(&firmware)
                .ok_or_else(|| OtaError::NotFound(format!("binary of firmware {}", firmware_id)))?;
            (firmware, path)
        };
        let image = tokio::fs::read(&path).await?;
        let (image, checksum) = md5_hex_blocking(image).await?;
        if checksum != firmware.file_checksum.to_lowercase() {
            return Err(OtaError::CorruptFirmware(firmware_id));
        }
        Ok((firmware, image))
    }
}

/// Worker body: wait for a free slot, then run the transfer.
async fn work(
    task: Arc<UploadTask>,
    workers: Arc<Semaphore>,
    sink: Arc<dyn ProgressSink>,
    settings: TransferSettings,
) {
    // an upload aborted while queued runs straight into ABORTED without a slot
    let _permit = tokio::select! {
        biased;
        _ = task.aborted() => None,
        permit = workers.acquire_owned() => permit.ok(),
    };
    task.run(sink.as_ref(), &settings).await;
}
