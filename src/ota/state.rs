use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

///
/// Lifecycle of an upload.
///
/// Non-terminal states are only ever entered in declaration order. Every
/// run ends in exactly one of `Finished`, `InvitationFailed`,
/// `FirmwareTransferFailed` or `Aborted`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum UploadState {
    Started = 0,
    Invitation = 1,
    InvitationAccepted = 2,
    FirmwareTransfer = 3,
    FirmwareTransferConfirmation = 4,
    FirmwareTransferFinished = 5,
    Finished = 6,
    InvitationFailed = 7,
    FirmwareTransferFailed = 8,
    Aborted = 9,
}

impl UploadState {
    pub const ALL: [UploadState; 10] = [
        UploadState::Started,
        UploadState::Invitation,
        UploadState::InvitationAccepted,
        UploadState::FirmwareTransfer,
        UploadState::FirmwareTransferConfirmation,
        UploadState::FirmwareTransferFinished,
        UploadState::Finished,
        UploadState::InvitationFailed,
        UploadState::FirmwareTransferFailed,
        UploadState::Aborted,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadState::Finished
                | UploadState::InvitationFailed
                | UploadState::FirmwareTransferFailed
                | UploadState::Aborted
        )
    }

    /// Whether a task in `self` may move to `next`.
    pub fn can_transition_to(self, next: UploadState) -> bool {
        use UploadState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Aborted => true,
            InvitationFailed => matches!(self, Started | Invitation),
            FirmwareTransferFailed => matches!(
                self,
                InvitationAccepted | FirmwareTransfer | FirmwareTransferConfirmation
            ),
            Started => false,
            _ => next as u8 == self as u8 + 1,
        }
    }

    fn from_u8(value: u8) -> UploadState {
        UploadState::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(UploadState::Aborted)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Started => "STARTED",
            UploadState::Invitation => "INVITATION",
            UploadState::InvitationAccepted => "INVITATION_ACCEPTED",
            UploadState::FirmwareTransfer => "FIRMWARE_TRANSFER",
            UploadState::FirmwareTransferConfirmation => "FIRMWARE_TRANSFER_CONFIRMATION",
            UploadState::FirmwareTransferFinished => "FIRMWARE_TRANSFER_FINISHED",
            UploadState::Finished => "FINISHED",
            UploadState::InvitationFailed => "INVITATION_FAILED",
            UploadState::FirmwareTransferFailed => "FIRMWARE_TRANSFER_FAILED",
            UploadState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

///
/// State and progress of one task, written by its worker and read by
/// status queries without locking.
///
#[derive(Debug)]
pub struct UploadStatus {
    state: AtomicU8,
    progress: AtomicU8,
}

impl Default for UploadStatus {
    fn default() -> Self {
        UploadStatus {
            state: AtomicU8::new(UploadState::Started as u8),
            progress: AtomicU8::new(0),
        }
    }
}

impl UploadStatus {
    pub fn state(&self) -> UploadState {
        UploadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Acquire)
    }

    /// Moves to `next` if the transition is allowed, returning whether it was.
    pub fn advance(&self, next: UploadState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if UploadState::from_u8(current).can_transition_to(next) {
                    Some(next as u8)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Raises the progress to `percent`. Progress never goes down.
    pub fn raise_progress(&self, percent: u8) -> bool {
        let percent = percent.min(100);
        self.progress.fetch_max(percent, Ordering::AcqRel) < percent
    }
}
