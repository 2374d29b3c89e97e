use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::RwLock;
use tokio::time::timeout;
use uuid::Uuid;

use crate::boards::BoardRegistry;
use crate::catalog::FirmwareCatalog;
use crate::device::{Device, DeviceDirectory, StaticDeviceDirectory};
use crate::firmware::{FirmwareInfo, NewFirmware};
use crate::ota::orchestrator::{UploadOrchestrator, DEFAULT_WORKERS};
use crate::storage::FirmwareBlobStore;
use crate::test_utilities::mock_device::MockDevice;
use crate::test_utilities::{fast_settings, loopback_device, RecordingSink};

static RELEASES: AtomicUsize = AtomicUsize::new(0);

/// An orchestrator over a throwaway catalog, recording every event.
pub struct TestManager {
    pub orchestrator: Arc<UploadOrchestrator>,
    pub catalog_lock: Arc<RwLock<FirmwareCatalog>>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub sink: RecordingSink,
    _data_dir: TempDir,
}

impl TestManager {
    pub async fn new(devices: Vec<Device>, boards: BoardRegistry) -> Self {
        TestManager::with_workers(devices, boards, DEFAULT_WORKERS).await
    }

    pub async fn with_workers(devices: Vec<Device>, boards: BoardRegistry, workers: usize) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let blobs = FirmwareBlobStore::open(data_dir.path().join("firmware")).unwrap();
        let catalog = FirmwareCatalog::open(data_dir.path().join("metadata"), blobs).unwrap();
        let catalog_lock = Arc::new(RwLock::new(catalog));
        let directory: Arc<dyn DeviceDirectory> = Arc::new(StaticDeviceDirectory::new(devices));
        let sink = RecordingSink::default();
        let orchestrator = Arc::new(UploadOrchestrator::new(
            catalog_lock.clone(),
            directory.clone(),
            boards,
            Arc::new(sink.clone()),
            fast_settings(),
            workers,
        ));
        TestManager {
            orchestrator,
            catalog_lock,
            directory,
            sink,
            _data_dir: data_dir,
        }
    }

    /// One device `dev-{board}` whose board invitations go to `device`.
    pub async fn with_mock(board: &str, device: &MockDevice) -> Self {
        let mut ports = HashMap::new();
        ports.insert(board.to_string(), device.port());
        TestManager::new(
            vec![loopback_device(&format!("dev-{}", board), board)],
            BoardRegistry::with_overrides(&ports),
        )
        .await
    }

    /// Publishes a `len` byte image for `board` under a fresh version.
    pub async fn add_firmware(&self, board: &str, len: usize) -> FirmwareInfo {
        let release = RELEASES.fetch_add(1, Ordering::SeqCst);
        let image: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let mut catalog = self.catalog_lock.write().await;
        catalog
            .create_firmware(
                &NewFirmware::new(board, "app", &format!("1.0.{}", release)),
                &image,
            )
            .unwrap()
    }

    /// Waits until task `task_id` has finished and been swept away.
    pub async fn wait_until_gone(&self, task_id: Uuid) {
        let orchestrator = &self.orchestrator;
        timeout(Duration::from_secs(10), async {
            loop {
                orchestrator.sweep().await;
                if orchestrator.upload_state(task_id).await.is_none() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("upload did not finish in time");
    }
}
