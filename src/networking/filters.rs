use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;
use warp::{body, Filter, Reply};

use crate::catalog::FirmwareCatalog;
use crate::firmware::NewFirmware;
use crate::ota::orchestrator::UploadOrchestrator;
use crate::progress::BroadcastProgressSink;

use super::handlers::{
    abort_upload_handler, delete_firmware_handler, firmware_binary_handler, handle_rejection,
    list_boards_handler, list_firmwares_handler, list_uploads_handler, progress_socket_handler,
    publish_firmware_handler, start_uploads_handler, update_firmware_handler,
};

/// Largest firmware binary accepted by `POST /firmwares`.
pub const MAX_FIRMWARE_SIZE: u64 = 32 * 1024 * 1024;
const MAX_JSON_SIZE: u64 = 64 * 1024;

/// Every route of the gateway API, with rejections rendered as JSON.
pub fn api_routes(
    catalog_lock: Arc<RwLock<FirmwareCatalog>>,
    orchestrator: Arc<UploadOrchestrator>,
    sink: BroadcastProgressSink,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    firmware_routes(catalog_lock)
        .or(board_routes(orchestrator.clone()))
        .or(upload_routes(orchestrator, sink))
        .recover(handle_rejection)
}

pub fn firmware_routes(
    catalog_lock: Arc<RwLock<FirmwareCatalog>>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let list = warp::get()
        .and(warp::path!("firmwares"))
        .and(with_catalog(catalog_lock.clone()))
        .and_then(list_firmwares_handler);
    let publish = warp::post()
        .and(warp::path!("firmwares"))
        .and(warp::query::<NewFirmware>())
        .and(body::content_length_limit(MAX_FIRMWARE_SIZE))
        .and(body::bytes())
        .and(with_catalog(catalog_lock.clone()))
        .and_then(publish_firmware_handler);
    let update = warp::patch()
        .and(warp::path!("firmwares" / Uuid))
        .and(body::content_length_limit(MAX_JSON_SIZE))
        .and(body::json())
        .and(with_catalog(catalog_lock.clone()))
        .and_then(update_firmware_handler);
    let delete = warp::delete()
        .and(warp::path!("firmwares" / Uuid))
        .and(with_catalog(catalog_lock.clone()))
        .and_then(delete_firmware_handler);
    let binary = warp::get()
        .and(warp::path!("firmwares" / Uuid / "binary"))
        .and(with_catalog(catalog_lock))
        .and_then(firmware_binary_handler);

    list.or(publish).or(update).or(delete).or(binary)
}

pub fn board_routes(
    orchestrator: Arc<UploadOrchestrator>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    warp::get()
        .and(warp::path!("boards"))
        .and(with_orchestrator(orchestrator))
        .and_then(list_boards_handler)
}

pub fn upload_routes(
    orchestrator: Arc<UploadOrchestrator>,
    sink: BroadcastProgressSink,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let events = warp::path!("uploads" / "events")
        .and(warp::ws())
        .and(with_sink(sink))
        .and_then(progress_socket_handler);
    let start = warp::post()
        .and(warp::path!("uploads"))
        .and(body::content_length_limit(MAX_JSON_SIZE))
        .and(body::json())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(start_uploads_handler);
    let list = warp::get()
        .and(warp::path!("uploads"))
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(list_uploads_handler);
    let abort = warp::delete()
        .and(warp::path!("uploads" / Uuid))
        .and(with_orchestrator(orchestrator))
        .and_then(abort_upload_handler);

    events.or(start).or(list).or(abort)
}

/// inject catalog lock
fn with_catalog(
    catalog_lock: Arc<RwLock<FirmwareCatalog>>,
) -> impl Filter<Extract = (Arc<RwLock<FirmwareCatalog>>,), Error = Infallible> + Clone {
    warp::any().map(move || catalog_lock.clone())
}

/// inject orchestrator
fn with_orchestrator(
    orchestrator: Arc<UploadOrchestrator>,
) -> impl Filter<Extract = (Arc<UploadOrchestrator>,), Error = Infallible> + Clone {
    warp::any().map(move || orchestrator.clone())
}

/// inject progress sink
fn with_sink(
    sink: BroadcastProgressSink,
) -> impl Filter<Extract = (BroadcastProgressSink,), Error = Infallible> + Clone {
    warp::any().map(move || sink.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::BoardRegistry;
    use crate::device::{DeviceDirectory, StaticDeviceDirectory};
    use crate::firmware::FirmwareInfo;
    use crate::networking::handlers::{ErrorBody, UploadOutcome};
    use crate::ota::orchestrator::DEFAULT_WORKERS;
    use crate::ota::state::UploadState;
    use crate::progress::{ProgressEvent, ProgressSink};
    use crate::storage::FirmwareBlobStore;
    use crate::test_utilities::{fast_settings, loopback_device};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use warp::http::StatusCode;

    struct Api {
        catalog_lock: Arc<RwLock<FirmwareCatalog>>,
        orchestrator: Arc<UploadOrchestrator>,
        sink: BroadcastProgressSink,
        _data_dir: TempDir,
    }

    impl Api {
        fn new() -> Api {
            let data_dir = tempfile::tempdir().unwrap();
            let blobs = FirmwareBlobStore::open(data_dir.path().join("firmware")).unwrap();
            let catalog = FirmwareCatalog::open(data_dir.path().join("metadata"), blobs).unwrap();
            let catalog_lock = Arc::new(RwLock::new(catalog));
            let directory: Arc<dyn DeviceDirectory> = Arc::new(StaticDeviceDirectory::new(vec![
                loopback_device("kitchen-sensor", "esp8266"),
            ]));
            let sink = BroadcastProgressSink::new(16);
            let orchestrator = Arc::new(UploadOrchestrator::new(
                catalog_lock.clone(),
                directory,
                BoardRegistry::default(),
                Arc::new(sink.clone()),
                fast_settings(),
                DEFAULT_WORKERS,
            ));
            Api {
                catalog_lock,
                orchestrator,
                sink,
                _data_dir: data_dir,
            }
        }

        fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
            api_routes(
                self.catalog_lock.clone(),
                self.orchestrator.clone(),
                self.sink.clone(),
            )
        }

        async fn publish(&self, board: &str, version: &str, binary: &[u8]) -> FirmwareInfo {
            let res = warp::test::request()
                .method("POST")
                .path(&format!("/firmwares?board={}&type=app&version={}", board, version))
                .body(binary)
                .reply(&self.routes())
                .await;
            assert_eq!(res.status(), StatusCode::CREATED);
            serde_json::from_slice(res.body()).unwrap()
        }
    }

    fn error_of(body: &[u8]) -> ErrorBody {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn publish_list_and_download() {
        let api = Api::new();
        let info = api.publish("esp32", "1.0.0", b"\x7fELF firmware").await;
        assert_eq!(info.firmware_type, "app");
        assert_eq!(info.file_checksum, crate::firmware::md5_hex(b"\x7fELF firmware"));

        let res = warp::test::request()
            .path("/firmwares")
            .reply(&api.routes())
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let listed: Vec<FirmwareInfo> = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(listed, vec![info.clone()]);

        let res = warp::test::request()
            .path(&format!("/firmwares/{}/binary", info.id))
            .reply(&api.routes())
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), b"\x7fELF firmware");
        assert_eq!(res.headers()["content-type"], "application/octet-stream");
    }

    #[tokio::test]
    async fn publish_errors_map_to_statuses() {
        let api = Api::new();
        let res = warp::test::request()
            .method("POST")
            .path("/firmwares?board=esp32&type=app&version=1.0.0")
            .body(b"")
            .reply(&api.routes())
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(res.body()).error, "validation");

        let res = warp::test::request()
            .method("POST")
            .path("/firmwares?board=esp32&version=1.0.0")
            .body(b"abc")
            .reply(&api.routes())
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        api.publish("esp32", "1.0.0", b"abc").await;
        let res = warp::test::request()
            .method("POST")
            .path("/firmwares?board=ESP32&type=app&version=1.0.0")
            .body(b"def")
            .reply(&api.routes())
            .await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert_eq!(error_of(res.body()).error, "conflict");
    }

    #[tokio::test]
    async fn patch_and_delete() {
        let api = Api::new();
        let info = api.publish("esp32", "1.0.0", b"abc").await;

        let res = warp::test::request()
            .method("PATCH")
            .path(&format!("/firmwares/{}", info.id))
            .json(&serde_json::json!({ "version": "1.0.1" }))
            .reply(&api.routes())
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let patched: FirmwareInfo = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(patched.version, "1.0.1");
        assert_eq!(patched.board, "esp32");

        let delete = || {
            warp::test::request()
                .method("DELETE")
                .path(&format!("/firmwares/{}", info.id))
        };
        assert_eq!(delete().reply(&api.routes()).await.status(), StatusCode::OK);
        let res = delete().reply(&api.routes()).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_of(res.body()).error, "not_found");
    }

    #[tokio::test]
    async fn boards_are_listed() {
        let api = Api::new();
        let res = warp::test::request().path("/boards").reply(&api.routes()).await;
        assert_eq!(res.status(), StatusCode::OK);
        let boards: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert!(boards
            .as_array()
            .unwrap()
            .iter()
            .any(|b| b["board"] == "esp32" && b["invitationPort"] == 3232));
    }

    #[tokio::test]
    async fn upload_batch_reports_each_device() {
        let api = Api::new();
        let info = api.publish("esp32", "1.0.0", b"abc").await;

        let res = warp::test::request()
            .method("POST")
            .path("/uploads")
            .json(&serde_json::json!({
                "firmwareId": info.id,
                "devices": ["kitchen-sensor", "ghost"]
            }))
            .reply(&api.routes())
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let outcomes: BTreeMap<String, UploadOutcome> = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes["kitchen-sensor"].task_id.is_none());
        assert!(outcomes["kitchen-sensor"]
            .error
            .as_ref()
            .unwrap()
            .contains("esp32"));
        assert!(outcomes["ghost"].error.as_ref().unwrap().contains("not found"));

        let value: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert!(value["ghost"]["taskId"].is_null());
    }

    #[tokio::test]
    async fn upload_batch_answers_once_per_device() {
        let api = Api::new();
        let info = api.publish("esp32", "1.0.0", b"abc").await;

        let res = warp::test::request()
            .method("POST")
            .path("/uploads")
            .json(&serde_json::json!({
                "firmwareId": info.id,
                "devices": ["kitchen-sensor", " Kitchen-Sensor "]
            }))
            .reply(&api.routes())
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let outcomes: BTreeMap<String, UploadOutcome> = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes["kitchen-sensor"].error.is_some());
    }

    #[tokio::test]
    async fn uploads_list_and_abort_unknown() {
        let api = Api::new();
        let res = warp::test::request().path("/uploads").reply(&api.routes()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), b"[]");

        let res = warp::test::request()
            .method("DELETE")
            .path(&format!("/uploads/{}", Uuid::new_v4()))
            .reply(&api.routes())
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let api = Api::new();
        let res = warp::test::request().path("/nowhere").reply(&api.routes()).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_of(res.body()).error, "not_found");
    }

    #[tokio::test]
    async fn progress_events_reach_websocket() {
        let api = Api::new();
        let mut client = warp::test::ws()
            .path("/uploads/events")
            .handshake(api.routes())
            .await
            .expect("handshake");

        let event = ProgressEvent::progress(Uuid::new_v4(), UploadState::FirmwareTransfer, 39);
        api.sink.publish(event.clone());

        let message = client.recv().await.unwrap();
        let received: ProgressEvent = serde_json::from_str(message.to_str().unwrap()).unwrap();
        assert_eq!(received, event);
    }
}
