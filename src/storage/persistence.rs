//! File-backed storage: whole-snapshot data file, version stamp and write lock.
//!
//! A file at `<path>` is accompanied by two sidecars:
//!
//! * `<path>.version` holds the latest durable version as a little-endian
//!   `u64`. It is rewritten only after the data file is durable, so a process
//!   that reads stamp `n` will find at least version `n` in the data file.
//! * `<path>.lock` is never written; it carries the advisory exclusive lock
//!   that serializes writers across processes.

use super::{Snapshot, StorageEngine};
use crate::core::{DbError, Result, Version};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

const FORMAT_VERSION: u16 = 1;

lazy_static! {
    /// Identifies data files written by this process.
    static ref SESSION_ID: Uuid = Uuid::new_v4();
}

// ============================================================================
// Data File
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    pub format_version: u16,
    pub version: Version,
    pub written_at: DateTime<Utc>,
    pub writer: Uuid,
}

#[derive(Serialize)]
struct DataFileRef<'a> {
    header: FileHeader,
    snapshot: &'a Snapshot,
}

#[derive(Deserialize)]
struct DataFile {
    header: FileHeader,
    snapshot: Snapshot,
}

/// Decodes only the header; the snapshot is skipped.
#[derive(Deserialize)]
struct DataFileHeader {
    header: FileHeader,
}

// ============================================================================
// File Storage
// ============================================================================

pub struct FileStorage {
    path: PathBuf,
    stamp_path: PathBuf,
    lock_path: PathBuf,
    lock_file: Mutex<Option<File>>,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            stamp_path: sidecar(&path, "version"),
            lock_path: sidecar(&path, "lock"),
            path,
            lock_file: Mutex::new(None),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn stamp_path(&self) -> &Path {
        &self.stamp_path
    }

    fn read_data_file(&self) -> Result<Option<Vec<u8>>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    fn decode_error(&self, e: rmp_serde::decode::Error) -> DbError {
        let attempted = self.durable_version().ok().flatten().unwrap_or(Version::ZERO);
        DbError::integrity(&self.path, attempted, format!("Failed to decode data file: {}", e))
    }

    /// Reads the data file together with its header.
    pub fn load_with_header(&self) -> Result<Option<(FileHeader, Snapshot)>> {
        let Some(data) = self.read_data_file()? else {
            return Ok(None);
        };
        let decoded: DataFile = rmp_serde::from_slice(&data).map_err(|e| self.decode_error(e))?;

        if decoded.header.format_version != FORMAT_VERSION {
            return Err(DbError::integrity(
                &self.path,
                decoded.snapshot.version(),
                format!(
                    "Unsupported data file format {} (expected {})",
                    decoded.header.format_version, FORMAT_VERSION
                ),
            ));
        }

        Ok(Some((decoded.header, decoded.snapshot)))
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Writes `bytes` next to `target` and renames it into place.
    fn write_atomically(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let dir = target
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(bytes)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(target).map_err(|e| DbError::from(e.error))?;
        Ok(())
    }

    fn write_stamp(&self, version: Version) -> Result<()> {
        self.write_atomically(&self.stamp_path, &version.as_u64().to_le_bytes())
    }
}

impl StorageEngine for FileStorage {
    fn location(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.load_with_header()?.map(|(_, snapshot)| snapshot))
    }

    fn durable_version(&self) -> Result<Option<Version>> {
        let bytes = match fs::read(&self.stamp_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            DbError::integrity(
                &self.path,
                Version::ZERO,
                format!("Version stamp has {} bytes, expected 8", bytes.len()),
            )
        })?;
        Ok(Some(Version(u64::from_le_bytes(raw))))
    }

    fn data_version(&self) -> Result<Option<Version>> {
        let Some(data) = self.read_data_file()? else {
            return Ok(None);
        };
        let decoded: DataFileHeader =
            rmp_serde::from_slice(&data).map_err(|e| self.decode_error(e))?;
        Ok(Some(decoded.header.version))
    }

    fn restore_stamp(&self, version: Version) -> Result<()> {
        self.write_stamp(version)
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        self.ensure_parent()?;
        let file = DataFileRef {
            header: FileHeader {
                format_version: FORMAT_VERSION,
                version: snapshot.version(),
                written_at: Utc::now(),
                writer: *SESSION_ID,
            },
            snapshot,
        };
        let serialized = rmp_serde::to_vec_named(&file)?;
        self.write_atomically(&self.path, &serialized)?;
        self.write_stamp(snapshot.version())
    }

    fn lock_exclusive(&self) -> Result<()> {
        let mut slot = self.lock_file.lock();
        if slot.is_none() {
            self.ensure_parent()?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.lock_path)?;
            *slot = Some(file);
        }
        if let Some(file) = slot.as_ref() {
            FileExt::lock_exclusive(file)?;
        }
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        if let Some(file) = self.lock_file.lock().as_ref() {
            FileExt::unlock(file)?;
        }
        Ok(())
    }

    fn is_shared(&self) -> bool {
        true
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
