use std::fmt::Display;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::{Device, DeviceKey};
use crate::firmware::FirmwareInfo;
use crate::ota::protocol::{
    chunk_count, is_accepted, percent, ConfirmationScanner, Invitation, ACK_FRAME_SIZE, CHUNK_SIZE,
    PROGRESS_INTERVAL_CHUNKS,
};
use crate::ota::state::{UploadState, UploadStatus};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::time::create_timestamp;

/// Timeouts and socket settings of a transfer.
#[derive(Clone, Debug)]
pub struct TransferSettings {
    /// local address both protocol sockets bind to
    pub bind_address: IpAddr,
    pub invitation_timeout: Duration,
    pub accept_timeout: Duration,
    pub ack_timeout: Duration,
    pub confirmation_window: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        TransferSettings {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            invitation_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            confirmation_window: Duration::from_secs(50),
        }
    }
}

///
/// Cooperative cancellation. The flag is checked before every blocking
/// step of a transfer, and the notifier wakes a step which is already
/// waiting on a socket.
///
#[derive(Debug, Default)]
pub struct AbortSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Completes once `abort` has been called.
    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// Why a transfer stopped before finishing.
#[derive(Debug)]
enum Halt {
    Aborted,
    Failed(UploadState, String),
}

type Step<T> = std::result::Result<T, Halt>;

fn failed(state: UploadState, reason: impl Display) -> Halt {
    Halt::Failed(state, reason.to_string())
}

///
/// One firmware transfer to one device.
///
/// The firmware record and device record are snapshots taken when the
/// upload was dispatched. Only the worker running the task changes its
/// status; everybody else reads it.
///
#[derive(Debug)]
pub struct UploadTask {
    id: Uuid,
    firmware: FirmwareInfo,
    device: Device,
    invitation_port: u16,
    image: Vec<u8>,
    started_at: u64,
    status: UploadStatus,
    abort: AbortSignal,
}

impl UploadTask {
    pub fn new(firmware: FirmwareInfo, device: Device, invitation_port: u16, image: Vec<u8>) -> Self {
        UploadTask {
            id: Uuid::new_v4(),
            firmware,
            device,
            invitation_port,
            image,
            started_at: create_timestamp(),
            status: UploadStatus::default(),
            abort: AbortSignal::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn firmware(&self) -> &FirmwareInfo {
        &self.firmware
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_key(&self) -> DeviceKey {
        self.device.key()
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn state(&self) -> UploadState {
        self.status.state()
    }

    pub fn progress(&self) -> u8 {
        self.status.progress()
    }

    /// Asks the task to stop at its next suspension point.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    pub async fn aborted(&self) {
        self.abort.aborted().await
    }

    ///
    /// Drives the transfer to a terminal state and returns it.
    ///
    /// Both sockets are owned by this call and are closed on every exit
    /// path. Failures end up in the returned state, never in a panic or
    /// an error.
    ///
    pub async fn run(&self, sink: &dyn ProgressSink, settings: &TransferSettings) -> UploadState {
        let final_state = match self.execute(sink, settings).await {
            Ok(()) => UploadState::Finished,
            Err(Halt::Aborted) => {
                info!("upload {} to {} aborted", self.id, self.device_key());
                UploadState::Aborted
            }
            Err(Halt::Failed(state, reason)) => {
                warn!(
                    "upload {} to {} failed in {}: {}",
                    self.id,
                    self.device_key(),
                    self.state(),
                    reason
                );
                state
            }
        };
        self.transition(sink, final_state);
        self.state()
    }

    async fn execute(&self, sink: &dyn ProgressSink, settings: &TransferSettings) -> Step<()> {
        self.checkpoint()?;
        let listener = TcpListener::bind((settings.bind_address, 0))
            .await
            .map_err(|err| failed(UploadState::InvitationFailed, format!("transfer socket: {}", err)))?;
        let transfer_port = listener
            .local_addr()
            .map_err(|err| failed(UploadState::InvitationFailed, err))?
            .port();

        self.invite(sink, settings, transfer_port).await?;
        let mut stream = self.accept(sink, settings, listener).await?;
        self.stream_image(sink, settings, &mut stream).await?;
        self.await_confirmation(sink, settings, &mut stream).await?;
        self.transition(sink, UploadState::FirmwareTransferFinished);
        Ok(())
    }

    async fn invite(
        &self,
        sink: &dyn ProgressSink,
        settings: &TransferSettings,
        transfer_port: u16,
    ) -> Step<()> {
        self.transition(sink, UploadState::Invitation);
        let fail = |reason: String| failed(UploadState::InvitationFailed, reason);

        let target = SocketAddr::new(self.device.ip, self.invitation_port);
        let socket = self
            .guarded(UdpSocket::bind((settings.bind_address, 0)))
            .await?
            .map_err(|err| fail(format!("invitation socket: {}", err)))?;
        socket
            .connect(target)
            .await
            .map_err(|err| fail(format!("invitation socket: {}", err)))?;

        let invitation = Invitation::new(
            transfer_port,
            self.image.len() as u64,
            &self.firmware.file_checksum,
        );
        self.guarded(socket.send(&invitation.serialize()))
            .await?
            .map_err(|err| fail(format!("sending invitation to {}: {}", target, err)))?;
        debug!("invitation sent to {} for upload {}", target, self.id);

        // room for more than the two expected bytes so longer replies are not truncated into "OK"
        let mut reply = [0u8; 16];
        let received = match self
            .guarded(timeout(settings.invitation_timeout, socket.recv(&mut reply)))
            .await?
        {
            Ok(Ok(received)) => received,
            Ok(Err(err)) => return Err(fail(format!("waiting for invitation reply: {}", err))),
            Err(_) => return Err(fail(String::from("device did not answer the invitation"))),
        };
        if !is_accepted(&reply[..received]) {
            return Err(fail(format!(
                "device declined the invitation: {:?}",
                String::from_utf8_lossy(&reply[..received])
            )));
        }
        self.transition(sink, UploadState::InvitationAccepted);
        Ok(())
    }

    async fn accept(
        &self,
        sink: &dyn ProgressSink,
        settings: &TransferSettings,
        listener: TcpListener,
    ) -> Step<TcpStream> {
        let (stream, peer) = match self
            .guarded(timeout(settings.accept_timeout, listener.accept()))
            .await?
        {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(err)) => return Err(failed(UploadState::FirmwareTransferFailed, err)),
            Err(_) => {
                return Err(failed(
                    UploadState::FirmwareTransferFailed,
                    "device did not connect to the transfer socket",
                ))
            }
        };
        if peer.ip() != self.device.ip {
            debug!("upload {}: transfer connection from {} instead of {}", self.id, peer, self.device.ip);
        }
        if let Err(err) = stream.set_nodelay(true) {
            debug!("upload {}: could not disable nagle: {}", self.id, err);
        }
        self.transition(sink, UploadState::FirmwareTransfer);
        Ok(stream)
    }

    async fn stream_image(
        &self,
        sink: &dyn ProgressSink,
        settings: &TransferSettings,
        stream: &mut TcpStream,
    ) -> Step<()> {
        let fail = |reason: String| failed(UploadState::FirmwareTransferFailed, reason);
        let total = self.image.len();
        let mut sent = 0;
        let mut ack = [0u8; ACK_FRAME_SIZE];
        debug!(
            "upload {}: streaming {} bytes in {} chunks",
            self.id,
            total,
            chunk_count(total)
        );

        for (index, chunk) in self.image.chunks(CHUNK_SIZE).enumerate() {
            self.guarded(stream.write_all(chunk))
                .await?
                .map_err(|err| fail(format!("writing chunk {}: {}", index, err)))?;
            match self
                .guarded(timeout(settings.ack_timeout, stream.read_exact(&mut ack)))
                .await?
            {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(fail(format!("acknowledgement of chunk {}: {}", index, err))),
                Err(_) => return Err(fail(format!("chunk {} was not acknowledged", index))),
            }
            sent += chunk.len();
            // the chunk which completes the image is reported below
            if (index + 1) % PROGRESS_INTERVAL_CHUNKS == 0 && sent < total {
                self.report_progress(sink, percent(sent, total));
            }
        }
        self.report_progress(sink, 100);
        Ok(())
    }

    async fn await_confirmation(
        &self,
        sink: &dyn ProgressSink,
        settings: &TransferSettings,
        stream: &mut TcpStream,
    ) -> Step<()> {
        self.transition(sink, UploadState::FirmwareTransferConfirmation);
        let fail = |reason: String| failed(UploadState::FirmwareTransferFailed, reason);
        let deadline = Instant::now() + settings.confirmation_window;
        let mut scanner = ConfirmationScanner::default();
        let mut buffer = [0u8; 64];

        loop {
            match self
                .guarded(timeout_at(deadline, stream.read(&mut buffer)))
                .await?
            {
                Ok(Ok(0)) => {
                    return Err(fail(String::from(
                        "device closed the connection before confirming",
                    )))
                }
                Ok(Ok(read)) => {
                    if scanner.feed(&buffer[..read]) {
                        return Ok(());
                    }
                }
                Ok(Err(err)) => return Err(fail(format!("reading confirmation: {}", err))),
                Err(_) => {
                    return Err(fail(String::from(
                        "device did not confirm within the confirmation window",
                    )))
                }
            }
        }
    }

    /// Returns `Aborted` if cancellation was requested.
    fn checkpoint(&self) -> Step<()> {
        if self.abort.is_aborted() {
            Err(Halt::Aborted)
        } else {
            Ok(())
        }
    }

    /// Runs one blocking step, giving up as soon as the task is aborted.
    async fn guarded<F: Future>(&self, step: F) -> Step<F::Output> {
        self.checkpoint()?;
        tokio::select! {
            biased;
            _ = self.abort.aborted() => Err(Halt::Aborted),
            output = step => Ok(output),
        }
    }

    fn transition(&self, sink: &dyn ProgressSink, next: UploadState) {
        if self.status.advance(next) {
            if next.is_terminal() {
                info!("upload {} to {} is now {}", self.id, self.device_key(), next);
            } else {
                debug!("upload {} to {} is now {}", self.id, self.device_key(), next);
            }
            sink.publish(ProgressEvent::state(self.id, next));
        } else {
            warn!("upload {}: refusing transition {} -> {}", self.id, self.state(), next);
        }
    }

    fn report_progress(&self, sink: &dyn ProgressSink, percent: u8) {
        if self.status.raise_progress(percent) {
            sink.publish(ProgressEvent::progress(self.id, self.state(), percent));
        }
    }
}
