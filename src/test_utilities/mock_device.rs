use std::cmp::min;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use crate::ota::protocol::{Invitation, ACCEPT_TOKEN, CHUNK_SIZE};

/// How the mock answers an invitation.
#[derive(Clone, Debug)]
pub enum InvitationReply {
    Accept,
    Reply(Vec<u8>),
    Silent,
}

#[derive(Clone, Debug)]
pub struct MockDeviceBehavior {
    pub reply: InvitationReply,
    /// whether to open the transfer connection after accepting
    pub connect: bool,
    /// pause before acknowledging each chunk
    pub ack_delay: Duration,
    /// whether to send `OK` once the whole image arrived
    pub confirm: bool,
    /// close the connection right after the image instead of holding it
    pub hang_up: bool,
}

impl Default for MockDeviceBehavior {
    fn default() -> Self {
        MockDeviceBehavior {
            reply: InvitationReply::Accept,
            connect: true,
            ack_delay: Duration::ZERO,
            confirm: true,
            hang_up: false,
        }
    }
}

/// What the mock saw, accumulated over every upload it served.
#[derive(Clone, Debug, Default)]
pub struct MockDeviceReport {
    pub invitations: Vec<Invitation>,
    pub chunks: usize,
    pub received: Vec<u8>,
    pub connected: bool,
}

///
/// A device speaking the OTA protocol on loopback. It listens for
/// invitations on an ephemeral UDP port and serves uploads one at a time.
///
pub struct MockDevice {
    port: u16,
    report: Arc<Mutex<MockDeviceReport>>,
    handle: JoinHandle<()>,
}

impl MockDevice {
    pub async fn spawn(behavior: MockDeviceBehavior) -> MockDevice {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let report = Arc::new(Mutex::new(MockDeviceReport::default()));
        let handle = tokio::spawn(serve(socket, behavior, report.clone()));
        MockDevice {
            port,
            report,
            handle,
        }
    }

    /// Invitation port of the mock.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn report(&self) -> MockDeviceReport {
        self.report.lock().unwrap().clone()
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(socket: UdpSocket, behavior: MockDeviceBehavior, report: Arc<Mutex<MockDeviceReport>>) {
    let mut buffer = [0u8; 256];
    loop {
        let (len, from) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(_) => continue,
        };
        let invitation = match Invitation::deserialize(&buffer[..len]) {
            Ok(invitation) => invitation,
            Err(_) => continue,
        };
        report.lock().unwrap().invitations.push(invitation.clone());

        match &behavior.reply {
            InvitationReply::Silent => continue,
            InvitationReply::Reply(bytes) => {
                let _ = socket.send_to(bytes, from).await;
                continue;
            }
            InvitationReply::Accept => {
                if socket.send_to(ACCEPT_TOKEN, from).await.is_err() {
                    continue;
                }
            }
        }

        if !behavior.connect {
            continue;
        }
        let target = SocketAddr::new(from.ip(), invitation.transfer_port);
        if let Ok(stream) = TcpStream::connect(target).await {
            report.lock().unwrap().connected = true;
            receive(stream, &invitation, &behavior, &report).await;
        }
    }
}

async fn receive(
    mut stream: TcpStream,
    invitation: &Invitation,
    behavior: &MockDeviceBehavior,
    report: &Mutex<MockDeviceReport>,
) {
    let mut remaining = invitation.firmware_length as usize;
    while remaining > 0 {
        let mut chunk = vec![0u8; min(CHUNK_SIZE, remaining)];
        if stream.read_exact(&mut chunk).await.is_err() {
            return;
        }
        remaining -= chunk.len();
        {
            let mut report = report.lock().unwrap();
            report.chunks += 1;
            report.received.extend_from_slice(&chunk);
        }
        if !behavior.ack_delay.is_zero() {
            tokio::time::sleep(behavior.ack_delay).await;
        }
        if stream.write_all(&[0, 0, 4, 0]).await.is_err() {
            return;
        }
    }

    if behavior.confirm {
        // split on purpose, the gateway has to stitch the token together
        let _ = stream.write_all(b"O").await;
        let _ = stream.flush().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = stream.write_all(b"K").await;
    }
    if behavior.hang_up {
        return;
    }
    // hold the connection until the gateway hangs up
    let mut sink = [0u8; 64];
    while let Ok(read) = stream.read(&mut sink).await {
        if read == 0 {
            break;
        }
    }
}
