use std::io;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the catalog and the upload orchestrator.
///
/// All of these are pre-flight errors: they are returned before a task is
/// created or a socket is opened. Failures of a running transfer are
/// reported through the task state instead.
#[derive(Debug, Error)]
pub enum OtaError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported board: {0}")]
    UnsupportedBoard(String),

    #[error("firmware {0} is corrupt: checksum of the stored binary does not match")]
    CorruptFirmware(Uuid),

    #[error("firmware targets board {firmware} but the device is a {device}")]
    BoardMismatch { firmware: String, device: String },

    #[error("metadata encoding failed: {0}")]
    Persistence(#[from] serde_json::Error),

    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for OtaError {
    /// Record codecs hand JSON failures back wrapped in an `io::Error`.
    fn from(err: io::Error) -> Self {
        let is_json = err
            .get_ref()
            .map_or(false, |inner| inner.is::<serde_json::Error>());
        if !is_json {
            return OtaError::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<serde_json::Error>()) {
            Some(Ok(json)) => OtaError::Persistence(*json),
            Some(Err(inner)) => OtaError::Io(io::Error::new(kind, inner)),
            None => OtaError::Io(io::Error::from(kind)),
        }
    }
}

impl OtaError {
    /// Short machine readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            OtaError::Validation(_) => "validation",
            OtaError::NotFound(_) => "not_found",
            OtaError::Conflict(_) => "conflict",
            OtaError::UnsupportedBoard(_) => "unsupported_board",
            OtaError::CorruptFirmware(_) => "corrupt_firmware",
            OtaError::BoardMismatch { .. } => "board_mismatch",
            OtaError::Persistence(_) => "persistence",
            OtaError::Io(_) => "io",
        }
    }
}

pub type OtaResult<T> = std::result::Result<T, OtaError>;
