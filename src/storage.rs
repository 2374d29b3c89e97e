use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use rand::{distributions::Alphanumeric, thread_rng, Rng};
use tracing::debug;

use crate::firmware::FirmwareInfo;

/// Length of the random suffix which keeps blob names unique.
pub const BLOB_SUFFIX_LEN: usize = 8;

///
/// Records which can be written to and read back from a directory as
/// JSON. Implemented through `#[derive(Persistable)]`.
///
pub trait Persistable: Sized {
    /// file name of the record inside its directory
    fn persisted_name(&self) -> String;
    /// write the record into `dir`, returning the full path
    fn save(&self, dir: &Path) -> io::Result<PathBuf>;
    /// read a record back from `path`
    fn load(path: &Path) -> io::Result<Self>;
}

pub struct Storage {}

impl Storage {
    /// read from a path to a Vec<u8>
    pub fn read(path: &Path) -> io::Result<Vec<u8>> {
        let mut f = File::open(path)?;
        let mut data = Vec::<u8>::new();
        f.read_to_end(&mut data)?;
        Ok(data)
    }

    pub fn write(data: &[u8], filename: &Path) -> io::Result<()> {
        let mut buffer = File::create(filename)?;
        buffer.write_all(data)?;
        buffer.sync_all()
    }

    pub fn file_exists(filename: &Path) -> bool {
        filename.is_file()
    }

    /// remove a file, treating a file which is already gone as removed
    pub fn remove(filename: &Path) -> io::Result<()> {
        match fs::remove_file(filename) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            res => res,
        }
    }
}

///
/// Firmware binaries on the local filesystem.
///
/// Blobs are named `{board}-{type}-{version}-{random}.bin`. The random
/// suffix keeps two uploads of the same release from overwriting each
/// other.
///
#[derive(Clone, Debug)]
pub struct FirmwareBlobStore {
    dir: PathBuf,
}

impl FirmwareBlobStore {
    /// Opens the store, creating its directory when needed.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FirmwareBlobStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn generate_blob_filename(info: &FirmwareInfo) -> String {
        let suffix: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(BLOB_SUFFIX_LEN)
            .map(char::from)
            .collect();
        format!(
            "{}-{}-{}-{}.bin",
            sanitize(&info.board),
            sanitize(&info.firmware_type),
            sanitize(&info.version),
            suffix
        )
    }

    /// Writes `bytes` under a freshly generated name and returns the name.
    pub fn create(&self, info: &FirmwareInfo, bytes: &[u8]) -> io::Result<String> {
        let filename = FirmwareBlobStore::generate_blob_filename(info);
        Storage::write(bytes, &self.dir.join(&filename))?;
        debug!("stored {} bytes as {}", bytes.len(), filename);
        Ok(filename)
    }

    /// Removes the blob referenced by `info`. A missing blob is not an error.
    pub fn delete(&self, info: &FirmwareInfo) -> io::Result<()> {
        match self.path_of(info) {
            Some(path) => Storage::remove(&path),
            None => Ok(()),
        }
    }

    /// Path of the blob referenced by `info`, if it currently exists.
    pub fn read(&self, info: &FirmwareInfo) -> Option<PathBuf> {
        let path = self.path_of(info)?;
        if Storage::file_exists(&path) {
            Some(path)
        } else {
            None
        }
    }

    fn path_of(&self, info: &FirmwareInfo) -> Option<PathBuf> {
        // a record may only point at a plain file name inside the store
        let name = Path::new(&info.file_name).file_name()?;
        if info.file_name.is_empty() || name != info.file_name.as_str() {
            return None;
        }
        Some(self.dir.join(name))
    }
}

fn sanitize(component: &str) -> String {
    component
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
