use std::io;

use macros::Persistable;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata of a firmware binary held in the catalog.
///
/// `file_checksum` is the lowercase hex MD5 of the bytes stored under
/// `file_name` at the time the record was written. It is verified again
/// before every upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Persistable)]
#[persist_with_name(record_file_name)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareInfo {
    pub id: Uuid,
    pub board: String,
    #[serde(rename = "type")]
    pub firmware_type: String,
    pub version: String,
    pub file_name: String,
    pub file_checksum: String,
}

impl FirmwareInfo {
    pub fn record_file_name(&self) -> String {
        format!("{}.json", self.id)
    }

    /// True when both records describe the same (board, type, version).
    pub fn same_release(&self, other: &NewFirmware) -> bool {
        normalize(&self.board) == normalize(&other.board)
            && normalize(&self.firmware_type) == normalize(&other.firmware_type)
            && normalize(&self.version) == normalize(&other.version)
    }

    /// Merges the non-blank fields of `patch` into this record.
    pub fn apply(&mut self, patch: &FirmwarePatch) {
        if let Some(board) = non_blank(&patch.board) {
            self.board = board;
        }
        if let Some(firmware_type) = non_blank(&patch.firmware_type) {
            self.firmware_type = firmware_type;
        }
        if let Some(version) = non_blank(&patch.version) {
            self.version = version;
        }
    }
}

/// Caller supplied metadata of a firmware that is about to be stored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewFirmware {
    pub board: String,
    #[serde(rename = "type")]
    pub firmware_type: String,
    pub version: String,
}

impl NewFirmware {
    pub fn new(board: &str, firmware_type: &str, version: &str) -> Self {
        NewFirmware {
            board: board.to_string(),
            firmware_type: firmware_type.to_string(),
            version: version.to_string(),
        }
    }

    /// Returns the names of the required fields which are blank.
    pub fn blank_fields(&self) -> Vec<&'static str> {
        let mut blank = vec![];
        if self.board.trim().is_empty() {
            blank.push("board");
        }
        if self.firmware_type.trim().is_empty() {
            blank.push("type");
        }
        if self.version.trim().is_empty() {
            blank.push("version");
        }
        blank
    }

    pub fn trimmed(&self) -> NewFirmware {
        NewFirmware::new(
            self.board.trim(),
            self.firmware_type.trim(),
            self.version.trim(),
        )
    }
}

/// Partial update of a firmware record. Missing or blank fields keep
/// their current value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwarePatch {
    #[serde(default)]
    pub board: Option<String>,
    #[serde(default, rename = "type")]
    pub firmware_type: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Lowercase hex MD5 digest of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// `md5_hex` on the blocking pool, handing the buffer back with its digest.
pub async fn md5_hex_blocking<B>(data: B) -> io::Result<(B, String)>
where
    B: AsRef<[u8]> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let checksum = md5_hex(data.as_ref());
        (data, checksum)
    })
    .await
    .map_err(io::Error::from)
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FirmwareInfo {
        FirmwareInfo {
            id: Uuid::new_v4(),
            board: String::from("esp32"),
            firmware_type: String::from("app"),
            version: String::from("1.0.0"),
            file_name: String::from("esp32-app-1.0.0-abcdefgh.bin"),
            file_checksum: md5_hex(b"firmware"),
        }
    }

    #[tokio::test]
    async fn blocking_digest_matches_and_returns_the_buffer() {
        let image: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let expected = md5_hex(&image);
        let (returned, checksum) = md5_hex_blocking(image.clone()).await.unwrap();
        assert_eq!(checksum, expected);
        assert_eq!(returned, image);
    }

    #[test]
    fn md5_hex_is_lowercase_32_chars() {
        let digest = md5_hex(b"hello world");
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(md5_hex(&[]), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn patch_ignores_blank_fields() {
        let mut info = sample();
        info.apply(&FirmwarePatch {
            board: Some(String::from("  ")),
            firmware_type: None,
            version: Some(String::from(" 1.0.1 ")),
        });
        assert_eq!(info.board, "esp32");
        assert_eq!(info.firmware_type, "app");
        assert_eq!(info.version, "1.0.1");
    }

    #[test]
    fn record_serializes_with_wire_field_names() {
        let info = sample();
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["type"], "app");
        assert_eq!(value["fileName"], "esp32-app-1.0.0-abcdefgh.bin");
        assert_eq!(value["fileChecksum"], info.file_checksum);
        assert!(value.get("firmwareType").is_none());
    }

    #[test]
    fn same_release_ignores_case_and_padding() {
        let info = sample();
        assert!(info.same_release(&NewFirmware::new("ESP32", " app", "1.0.0 ")));
        assert!(!info.same_release(&NewFirmware::new("esp32", "app", "1.0.1")));
    }

    #[test]
    fn blank_fields_are_reported() {
        let raw = NewFirmware::new("esp32", " ", "");
        assert_eq!(raw.blank_fields(), vec!["type", "version"]);
    }
}
