/*!
# OTA wire format

## Invitation (UDP, gateway → device)

ASCII, fields separated by single spaces, no terminator:

```text
<command> <transfer port> <firmware length> <md5 hex>
```

`command` is `0` for a flash upload. The device answers with the two
bytes `OK` when it accepts.

## Transfer (TCP, device connects to the gateway)

```text
0..1024     firmware chunk          gateway → device
0..4        acknowledgement         device → gateway
...
"OK"        confirmation            device → gateway
```

The acknowledgement only paces the stream, its content is not checked.
After the last chunk the gateway keeps reading until it sees `OK`.
*/

use std::convert::TryFrom;

use thiserror::Error;

/// Command literal asking the device to accept a flash upload.
pub const FLASH_COMMAND: u32 = 0;
pub const CHUNK_SIZE: usize = 1024;
pub const ACK_FRAME_SIZE: usize = 4;
/// Progress is pushed once per this many chunks.
pub const PROGRESS_INTERVAL_CHUNKS: usize = 20;
pub const ACCEPT_TOKEN: &[u8] = b"OK";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invitation {
    pub command: u32,
    pub transfer_port: u16,
    pub firmware_length: u64,
    pub checksum: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("malformed invitation: {0}")]
pub struct MalformedInvitation(pub String);

impl Invitation {
    pub fn new(transfer_port: u16, firmware_length: u64, checksum: &str) -> Invitation {
        Invitation {
            command: FLASH_COMMAND,
            transfer_port,
            firmware_length,
            checksum: checksum.to_string(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        format!(
            "{} {} {} {}",
            self.command, self.transfer_port, self.firmware_length, self.checksum
        )
        .into_bytes()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Invitation, MalformedInvitation> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| MalformedInvitation(String::from("not ascii")))?;
        let fields: Vec<&str> = text.split(' ').collect();
        if fields.len() != 4 {
            return Err(MalformedInvitation(format!(
                "expected 4 fields, got {}",
                fields.len()
            )));
        }
        let number = |field: &str, name: &str| {
            field
                .parse::<u64>()
                .map_err(|_| MalformedInvitation(format!("{} is not a number", name)))
        };
        let command = u32::try_from(number(fields[0], "command")?)
            .map_err(|_| MalformedInvitation(String::from("command out of range")))?;
        let transfer_port = u16::try_from(number(fields[1], "transfer port")?)
            .map_err(|_| MalformedInvitation(String::from("transfer port out of range")))?;
        let firmware_length = number(fields[2], "firmware length")?;
        let checksum = fields[3];
        if checksum.len() != 32 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(MalformedInvitation(String::from(
                "checksum must be 32 hex characters",
            )));
        }
        Ok(Invitation {
            command,
            transfer_port,
            firmware_length,
            checksum: checksum.to_string(),
        })
    }
}

/// Whether an invitation reply accepts the upload.
pub fn is_accepted(reply: &[u8]) -> bool {
    reply == ACCEPT_TOKEN
}

///
/// Scans the confirmation stream for the `OK` token. The token may be
/// split across reads, so the last byte of each read is carried over.
///
#[derive(Debug, Default)]
pub struct ConfirmationScanner {
    carry: Option<u8>,
}

impl ConfirmationScanner {
    pub fn feed(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let mut window = Vec::with_capacity(data.len() + 1);
        window.extend(self.carry);
        window.extend_from_slice(data);
        if window.windows(ACCEPT_TOKEN.len()).any(|w| w == ACCEPT_TOKEN) {
            return true;
        }
        self.carry = data.last().copied();
        false
    }
}

/// Number of chunks needed for `length` bytes.
pub fn chunk_count(length: usize) -> usize {
    (length + CHUNK_SIZE - 1) / CHUNK_SIZE
}

/// `floor(sent * 100 / total)`, with an empty image counting as done.
pub fn percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent as u64 * 100) / total as u64).min(100) as u8
}
