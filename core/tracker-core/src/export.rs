//! Encrypted daily snapshot export.
//!
//! `export_snapshot(date)` reads the day's records, serializes them to JSON,
//! encrypts with AES-256-GCM and hands the blob to an [`Uploader`] as
//! `BrowsingSummary_{date}.json`. Failures are reported, never retried here;
//! the store is read-only to this pipeline so nothing is lost on failure.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::NaiveDate;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, TrackerError};
use crate::store::TrackerStore;
use crate::types::DailyDomainRecord;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

pub trait Encryptor: Send {
    /// Returns `nonce || ciphertext`.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
}

pub trait Uploader: Send {
    fn upload(&self, bytes: &[u8], name: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// AES-GCM
// ═══════════════════════════════════════════════════════════════════════════════

pub struct AesGcmEncryptor {
    key: [u8; KEY_LEN],
}

impl AesGcmEncryptor {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Loads the key at `path`, generating and persisting a fresh one first
    /// if the file does not exist.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        load_or_create_key(path).map(Self::new)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(TrackerError::export("decrypt", "ciphertext too short"));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TrackerError::export("decrypt", "authentication failed"))
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| TrackerError::export("encrypt", "AES-GCM encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }
}

fn load_or_create_key(path: &Path) -> Result<[u8; KEY_LEN]> {
    if path.exists() {
        let bytes = fs_err::read(path).map_err(|source| TrackerError::Io {
            context: format!("reading export key {}", path.display()),
            source,
        })?;
        return bytes.as_slice().try_into().map_err(|_| {
            TrackerError::export(
                "key",
                format!("{} must hold exactly {} bytes", path.display(), KEY_LEN),
            )
        });
    }

    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    write_atomically(path, &key, true)?;
    info!(path = %path.display(), "Generated export key");
    Ok(key)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Upload
// ═══════════════════════════════════════════════════════════════════════════════

/// Writes into a locally synced drive folder; the drive client ships it.
pub struct DirectoryUploader {
    dir: PathBuf,
}

impl DirectoryUploader {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl Uploader for DirectoryUploader {
    fn upload(&self, bytes: &[u8], name: &str) -> Result<()> {
        if name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(TrackerError::export("upload", format!("invalid file name {}", name)));
        }
        write_atomically(&self.dir.join(name), bytes, false)
    }
}

fn write_atomically(path: &Path, bytes: &[u8], private: bool) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| TrackerError::export("write", format!("{} has no parent", path.display())))?;
    fs_err::create_dir_all(parent).map_err(|source| TrackerError::Io {
        context: format!("creating {}", parent.display()),
        source,
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|source| TrackerError::Io {
        context: format!("creating temp file in {}", parent.display()),
        source,
    })?;
    temp.write_all(bytes).map_err(|source| TrackerError::Io {
        context: format!("writing {}", path.display()),
        source,
    })?;
    temp.as_file().sync_all().map_err(|source| TrackerError::Io {
        context: format!("syncing {}", path.display()),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if private {
            fs_err::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|source| TrackerError::Io {
                    context: format!("restricting permissions on {}", path.display()),
                    source,
                })?;
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    temp.persist(path).map_err(|err| TrackerError::Io {
        context: format!("persisting {}", path.display()),
        source: err.error,
    })?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExportOutcome {
    Uploaded { name: String, records: usize, bytes: usize },
    /// No records for the date; nothing was uploaded.
    Empty,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot<'a> {
    date: NaiveDate,
    records: &'a [DailyDomainRecord],
}

pub struct ExportPipeline {
    store: Arc<dyn TrackerStore>,
    encryptor: Box<dyn Encryptor>,
    uploader: Box<dyn Uploader>,
}

pub fn snapshot_name(date: NaiveDate) -> String {
    format!("BrowsingSummary_{}.json", date.format("%Y-%m-%d"))
}

impl ExportPipeline {
    pub fn new(
        store: Arc<dyn TrackerStore>,
        encryptor: Box<dyn Encryptor>,
        uploader: Box<dyn Uploader>,
    ) -> Self {
        Self {
            store,
            encryptor,
            uploader,
        }
    }

    pub fn export_snapshot(&self, date: NaiveDate) -> Result<ExportOutcome> {
        let records = self.store.records_for_date(date)?;
        if records.is_empty() {
            info!(date = %date, "No records to export");
            return Ok(ExportOutcome::Empty);
        }

        let payload = serde_json::to_vec(&Snapshot {
            date,
            records: &records,
        })
        .map_err(|source| TrackerError::Json {
            context: "serializing export snapshot".to_string(),
            source,
        })?;
        let blob = self.encryptor.encrypt(&payload)?;
        let name = snapshot_name(date);
        self.uploader.upload(&blob, &name)?;

        info!(
            date = %date,
            name = %name,
            records = records.len(),
            bytes = blob.len(),
            "Snapshot exported"
        );
        Ok(ExportOutcome::Uploaded {
            name,
            records: records.len(),
            bytes: blob.len(),
        })
    }
}
