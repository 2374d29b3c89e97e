use std::{
    collections::HashMap,
    fs,
    io,
    path::{Path, PathBuf},
};

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{OtaError, OtaResult};
use crate::firmware::{md5_hex, FirmwareInfo, FirmwarePatch, NewFirmware};
use crate::storage::{FirmwareBlobStore, Persistable, Storage};

///
/// The `FirmwareCatalog` holds the metadata of every stored firmware.
///
/// Records are cached in memory and written through to one JSON file per
/// firmware in the metadata directory. Binaries live in the
/// `FirmwareBlobStore`. The catalog is shared as `Arc<RwLock<FirmwareCatalog>>`.
///
#[derive(Debug)]
pub struct FirmwareCatalog {
    metadata_dir: PathBuf,
    blobs: FirmwareBlobStore,
    records: HashMap<Uuid, FirmwareInfo>,
}

impl FirmwareCatalog {
    /// Opens the catalog and loads every readable record from `metadata_dir`.
    pub fn open(metadata_dir: impl Into<PathBuf>, blobs: FirmwareBlobStore) -> OtaResult<Self> {
        let metadata_dir = metadata_dir.into();
        fs::create_dir_all(&metadata_dir)?;

        let mut records = HashMap::new();
        for entry in fs::read_dir(&metadata_dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match FirmwareInfo::load(&path) {
                Ok(record) => {
                    records.insert(record.id, record);
                }
                Err(err) => warn!("skipping unreadable firmware record {:?}: {}", path, err),
            }
        }
        info!(
            "loaded {} firmware records from {:?}",
            records.len(),
            metadata_dir
        );

        Ok(FirmwareCatalog {
            metadata_dir,
            blobs,
            records,
        })
    }

    pub fn blobs(&self) -> &FirmwareBlobStore {
        &self.blobs
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    /// Adds a record. Fails with `Conflict` if the id is already taken.
    pub fn add(&mut self, info: FirmwareInfo) -> OtaResult<()> {
        if self.records.contains_key(&info.id) {
            return Err(OtaError::Conflict(format!("firmware {} already exists", info.id)));
        }
        info.save(&self.metadata_dir)?;
        self.records.insert(info.id, info);
        Ok(())
    }

    /// Merges the non-blank fields of `patch` into the record with `id`.
    pub fn update(&mut self, id: Uuid, patch: &FirmwarePatch) -> OtaResult<FirmwareInfo> {
        let current = self
            .records
            .get(&id)
            .ok_or_else(|| OtaError::NotFound(format!("firmware {}", id)))?;
        let mut updated = current.clone();
        updated.apply(patch);
        updated.save(&self.metadata_dir)?;
        self.records.insert(id, updated.clone());
        Ok(updated)
    }

    /// Removes the record with `id` together with its binary.
    pub fn delete(&mut self, id: Uuid) -> OtaResult<FirmwareInfo> {
        let info = self
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| OtaError::NotFound(format!("firmware {}", id)))?;
        Storage::remove(&self.metadata_dir.join(info.persisted_name()))?;
        self.records.remove(&id);
        if let Err(err) = self.blobs.delete(&info) {
            warn!("firmware {} deleted but its binary was left behind: {}", id, err);
        }
        Ok(info)
    }

    pub fn get(&self, id: Uuid) -> Option<FirmwareInfo> {
        self.records.get(&id).cloned()
    }

    pub fn find<P>(&self, predicate: P) -> Vec<FirmwareInfo>
    where
        P: Fn(&FirmwareInfo) -> bool,
    {
        let mut found: Vec<FirmwareInfo> = self
            .records
            .values()
            .filter(|info| predicate(info))
            .cloned()
            .collect();
        sort_records(&mut found);
        found
    }

    pub fn get_all(&self) -> Vec<FirmwareInfo> {
        self.find(|_| true)
    }

    ///
    /// Stores a new firmware binary and its metadata.
    ///
    /// The checksum is computed here from `bytes`. If anything fails after
    /// the blob has been written, the blob is removed again before the
    /// error is returned.
    ///
    pub fn create_firmware(&mut self, raw: &NewFirmware, bytes: &[u8]) -> OtaResult<FirmwareInfo> {
        self.create_digested_firmware(raw, bytes, md5_hex(bytes))
    }

    /// `create_firmware` for a binary whose `md5_hex` the caller already
    /// computed, typically before taking the catalog lock.
    pub fn create_digested_firmware(
        &mut self,
        raw: &NewFirmware,
        bytes: &[u8],
        checksum: String,
    ) -> OtaResult<FirmwareInfo> {
        let blank = raw.blank_fields();
        if !blank.is_empty() {
            return Err(OtaError::Validation(format!(
                "{} must not be blank",
                blank.join(", ")
            )));
        }
        if bytes.is_empty() {
            return Err(OtaError::Validation(String::from(
                "firmware binary must not be empty",
            )));
        }
        let raw = raw.trimmed();
        if let Some(existing) = self.records.values().find(|info| info.same_release(&raw)) {
            return Err(OtaError::Conflict(format!(
                "firmware {} {} {} already exists as {}",
                raw.board, raw.firmware_type, raw.version, existing.id
            )));
        }

        let mut info = FirmwareInfo {
            id: Uuid::new_v4(),
            board: raw.board,
            firmware_type: raw.firmware_type,
            version: raw.version,
            file_name: String::new(),
            file_checksum: checksum,
        };
        info.file_name = self.blobs.create(&info, bytes)?;

        if let Err(err) = self.add(info.clone()) {
            if let Err(cleanup_err) = self.blobs.delete(&info) {
                warn!("could not remove orphaned blob {}: {}", info.file_name, cleanup_err);
            }
            return Err(err);
        }
        info!(
            "stored firmware {} ({} {} {}, {} bytes)",
            info.id,
            info.board,
            info.firmware_type,
            info.version,
            bytes.len()
        );
        Ok(info)
    }

    /// Reads the binary of firmware `id`.
    pub fn read_binary(&self, id: Uuid) -> OtaResult<(FirmwareInfo, Vec<u8>)> {
        let info = self
            .get(id)
            .ok_or_else(|| OtaError::NotFound(format!("firmware {}", id)))?;
        let path = self
            .blobs
            .read(&info)
            .ok_or_else(|| OtaError::NotFound(format!("binary of firmware {}", id)))?;
        let bytes = Storage::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => OtaError::NotFound(format!("binary of firmware {}", id)),
            _ => OtaError::Io(err),
        })?;
        Ok((info, bytes))
    }
}

fn sort_records(records: &mut [FirmwareInfo]) {
    records.sort_by(|a, b| {
        (&a.board, &a.firmware_type, &a.version).cmp(&(&b.board, &b.firmware_type, &b.version))
    });
}
