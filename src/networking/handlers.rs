use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;
use warp::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::{self, Response};
use warp::{Rejection, Reply};

use crate::catalog::FirmwareCatalog;
use crate::error::OtaError;
use crate::firmware::{md5_hex_blocking, FirmwarePatch, NewFirmware};
use crate::networking::socket;
use crate::ota::orchestrator::UploadOrchestrator;
use crate::progress::BroadcastProgressSink;

pub type Result = std::result::Result<Response, Rejection>;

/// Body of `POST /uploads`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub firmware_id: Uuid,
    pub devices: Vec<String>,
}

/// Per-device entry of the `POST /uploads` answer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub fn status_of(err: &OtaError) -> StatusCode {
    match err {
        OtaError::Validation(_) => StatusCode::BAD_REQUEST,
        OtaError::NotFound(_) => StatusCode::NOT_FOUND,
        OtaError::Conflict(_) => StatusCode::CONFLICT,
        OtaError::UnsupportedBoard(_) | OtaError::BoardMismatch { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        OtaError::CorruptFirmware(_) | OtaError::Persistence(_) | OtaError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_reply(status: StatusCode, kind: &str, message: String) -> Response {
    reply::with_status(
        reply::json(&ErrorBody {
            error: kind.to_string(),
            message,
        }),
        status,
    )
    .into_response()
}

fn ota_error_reply(err: OtaError) -> Response {
    let status = status_of(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {}", err);
    } else {
        debug!("request refused: {}", err);
    }
    error_reply(status, err.kind(), err.to_string())
}

fn respond<T: Serialize>(result: std::result::Result<T, OtaError>, status: StatusCode) -> Response {
    match result {
        Ok(value) => reply::with_status(reply::json(&value), status).into_response(),
        Err(err) => ota_error_reply(err),
    }
}

pub async fn list_firmwares_handler(catalog_lock: Arc<RwLock<FirmwareCatalog>>) -> Result {
    let catalog = catalog_lock.read().await;
    Ok(reply::json(&catalog.get_all()).into_response())
}

pub async fn publish_firmware_handler(
    metadata: NewFirmware,
    body: Bytes,
    catalog_lock: Arc<RwLock<FirmwareCatalog>>,
) -> Result {
    let (body, checksum) = match md5_hex_blocking(body).await {
        Ok(digested) => digested,
        Err(err) => return Ok(ota_error_reply(OtaError::from(err))),
    };
    let mut catalog = catalog_lock.write().await;
    Ok(respond(
        catalog.create_digested_firmware(&metadata, &body, checksum),
        StatusCode::CREATED,
    ))
}

pub async fn update_firmware_handler(
    id: Uuid,
    patch: FirmwarePatch,
    catalog_lock: Arc<RwLock<FirmwareCatalog>>,
) -> Result {
    let mut catalog = catalog_lock.write().await;
    Ok(respond(catalog.update(id, &patch), StatusCode::OK))
}

pub async fn delete_firmware_handler(id: Uuid, catalog_lock: Arc<RwLock<FirmwareCatalog>>) -> Result {
    let mut catalog = catalog_lock.write().await;
    Ok(respond(catalog.delete(id), StatusCode::OK))
}

pub async fn firmware_binary_handler(id: Uuid, catalog_lock: Arc<RwLock<FirmwareCatalog>>) -> Result {
    let catalog = catalog_lock.read().await;
    match catalog.read_binary(id) {
        Ok((info, bytes)) => {
            let disposition = format!("attachment; filename=\"{}\"", info.file_name);
            let response = reply::with_header(bytes, CONTENT_TYPE, "application/octet-stream");
            Ok(reply::with_header(response, CONTENT_DISPOSITION, disposition).into_response())
        }
        Err(err) => Ok(ota_error_reply(err)),
    }
}

pub async fn list_boards_handler(orchestrator: Arc<UploadOrchestrator>) -> Result {
    Ok(reply::json(&orchestrator.boards().boards()).into_response())
}

pub async fn start_uploads_handler(
    request: UploadRequest,
    orchestrator: Arc<UploadOrchestrator>,
) -> Result {
    if request.devices.is_empty() {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "validation",
            String::from("invalid request: devices must not be empty"),
        ));
    }
    let outcomes: BTreeMap<String, UploadOutcome> = orchestrator
        .upload_firmware_batch(request.firmware_id, &request.devices)
        .await
        .into_iter()
        .map(|(device, result)| {
            let outcome = match result {
                Ok(task_id) => UploadOutcome {
                    task_id: Some(task_id),
                    error: None,
                },
                Err(err) => UploadOutcome {
                    task_id: None,
                    error: Some(err.to_string()),
                },
            };
            (device, outcome)
        })
        .collect();
    Ok(reply::json(&outcomes).into_response())
}

pub async fn list_uploads_handler(orchestrator: Arc<UploadOrchestrator>) -> Result {
    Ok(reply::json(&orchestrator.list_running_uploads().await).into_response())
}

pub async fn abort_upload_handler(task_id: Uuid, orchestrator: Arc<UploadOrchestrator>) -> Result {
    match orchestrator.abort_upload(task_id).await {
        Ok(()) => Ok(reply::with_status(reply::reply(), StatusCode::ACCEPTED).into_response()),
        Err(err) => Ok(ota_error_reply(err)),
    }
}

pub async fn progress_socket_handler(
    ws: warp::ws::Ws,
    sink: BroadcastProgressSink,
) -> std::result::Result<impl Reply, Rejection> {
    // subscribe before the upgrade so no event published after the handshake is missed
    let events = sink.subscribe();
    Ok(ws.on_upgrade(move |socket| socket::forward_progress(socket, events)))
}

/// Turns warp's own rejections into the JSON error shape.
pub async fn handle_rejection(rejection: Rejection) -> std::result::Result<Response, Infallible> {
    let (status, kind, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found", String::from("no such route"))
    } else if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, "validation", err.to_string())
    } else if let Some(err) = rejection.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, "validation", err.to_string())
    } else if let Some(err) = rejection.find::<warp::reject::PayloadTooLarge>() {
        (StatusCode::PAYLOAD_TOO_LARGE, "validation", err.to_string())
    } else if let Some(err) = rejection.find::<warp::reject::MethodNotAllowed>() {
        (StatusCode::METHOD_NOT_ALLOWED, "validation", err.to_string())
    } else {
        error!("unhandled rejection: {:?}", rejection);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            String::from("internal error"),
        )
    };
    Ok(error_reply(status, kind, message))
}
