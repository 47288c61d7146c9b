//! Durable last-resort fallback tier.
//!
//! Records are stored as JSON, one directory per namespace and one file per
//! record id. Nothing here decides whether data is fresh: a record is only
//! read when both the network and the in-memory tier have failed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::StorageError;

/// Namespace for tabular (sheet) payloads.
pub const SHEETS_NAMESPACE: &str = "sheets_data";

/// Namespace for hierarchical-file (drive) payloads.
pub const FILES_NAMESPACE: &str = "drive_files";

const RECORD_EXTENSION: &str = "json";

const TEMP_EXTENSION: &str = "tmp";

/// Longest encoded name kept verbatim; longer names are cut and suffixed
/// with a digest of the full raw name. Stays well under the 255-byte limit
/// once the extension and temp suffix are added.
const MAX_ENCODED_NAME_LEN: usize = 160;

/// Hex characters of the digest appended to a shortened name.
const NAME_DIGEST_LEN: usize = 16;

/// Distinguishes temp files of concurrent writes to the same record.
static WRITE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentRecord<T> {
    pub id: String,
    pub payload: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> PersistentRecord<T> {
    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.timestamp).num_minutes()
    }

    pub fn age_display(&self) -> String {
        match self.age_minutes() {
            // Also covers clock skew
            m if m < 1 => "just now".to_string(),
            m if m < 60 => format!("{}m ago", m),
            m if m < 24 * 60 => format!("{}h ago", (m + 30) / 60),
            m => format!("{}d ago", (m + 12 * 60) / (24 * 60)),
        }
    }
}

/// Borrowing twin of [`PersistentRecord`] for writes.
#[derive(Serialize)]
struct RecordRef<'a, T> {
    id: &'a str,
    payload: &'a T,
    timestamp: DateTime<Utc>,
}

/// Encode an arbitrary id or namespace into a portable file name.
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `~xx`. Over-long results keep a prefix plus a digest of `raw`, so distinct
/// ids stay distinct. The full id lives inside the record.
fn encode_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("~{:02x}", byte));
        }
    }
    if out.is_empty() {
        out.push('~');
    }
    if out.len() > MAX_ENCODED_NAME_LEN {
        let digest = Sha256::digest(raw.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        // Output is ASCII, so any byte offset is a char boundary
        out.truncate(MAX_ENCODED_NAME_LEN - NAME_DIGEST_LEN - 1);
        out.push('.');
        out.push_str(&hex[..NAME_DIGEST_LEN]);
    }
    out
}

pub struct PersistentStore {
    root: PathBuf,
    quota_bytes: Option<u64>,
}

impl PersistentStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            quota_bytes: None,
        }
    }

    /// Cap the total bytes on disk across every namespace.
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(encode_name(namespace))
    }

    fn record_path(&self, namespace: &str, id: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.{}", encode_name(id), RECORD_EXTENSION))
    }

    /// Idempotent upsert. `StorageError::QuotaExceeded` is non-fatal: the
    /// caller carries on without durability.
    pub async fn put<T: Serialize>(
        &self,
        namespace: &str,
        id: &str,
        payload: &T,
    ) -> Result<(), StorageError> {
        let record = RecordRef {
            id,
            payload,
            timestamp: Utc::now(),
        };
        let contents = serde_json::to_vec(&record)?;
        let path = self.record_path(namespace, id);

        if let Some(quota) = self.quota_bytes {
            let existing = file_len(&path).await;
            let used = self.usage_bytes().await?;
            let needed = used.saturating_sub(existing) + contents.len() as u64;
            if needed > quota {
                return Err(StorageError::QuotaExceeded {
                    namespace: namespace.to_string(),
                    id: id.to_string(),
                    needed,
                    quota,
                });
            }
        }

        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir).await?;
        // Each write gets its own temp file; the rename is the atomic step
        let sequence = WRITE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!(
            "{}.{}.{}",
            std::process::id(),
            sequence,
            TEMP_EXTENSION
        ));
        if let Err(e) = write_then_rename(&tmp, &path, &contents).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        debug!(namespace = namespace, id = id, bytes = contents.len(), "Persisted record");
        Ok(())
    }

    /// Full record, or `None` when missing, unreadable or in an incompatible shape.
    pub async fn get_record<T: DeserializeOwned>(
        &self,
        namespace: &str,
        id: &str,
    ) -> Option<PersistentRecord<T>> {
        let path = self.record_path(namespace, id);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(namespace = namespace, id = id, error = %e, "Failed to read persisted record");
                return None;
            }
        };
        match serde_json::from_slice(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(namespace = namespace, id = id, error = %e, "Persisted record has incompatible shape, treating as miss");
                None
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, namespace: &str, id: &str) -> Option<T> {
        self.get_record(namespace, id).await.map(|r| r.payload)
    }

    /// Every decodable record in `namespace`, oldest first.
    pub async fn list<T: DeserializeOwned>(&self, namespace: &str) -> Vec<PersistentRecord<T>> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.namespace_dir(namespace)).await {
            Ok(entries) => entries,
            Err(_) => return records,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Ok(contents) = tokio::fs::read(&path).await else {
                continue;
            };
            if let Ok(record) = serde_json::from_slice::<PersistentRecord<T>>(&contents) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.timestamp);
        records
    }

    pub async fn delete(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.record_path(namespace, id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub async fn clear_namespace(&self, namespace: &str) -> Result<(), StorageError> {
        remove_dir_if_exists(&self.namespace_dir(namespace)).await
    }

    /// Explicit full wipe of every namespace.
    pub async fn wipe(&self) -> Result<(), StorageError> {
        remove_dir_if_exists(&self.root).await?;
        debug!(root = %self.root.display(), "Persistent store wiped");
        Ok(())
    }

    /// Total bytes of every record file under the root.
    pub async fn usage_bytes(&self) -> Result<u64, StorageError> {
        let mut total = 0;
        let mut namespaces = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(namespace) = namespaces.next_entry().await? {
            if !namespace.file_type().await?.is_dir() {
                continue;
            }
            let mut records = tokio::fs::read_dir(namespace.path()).await?;
            while let Some(record) = records.next_entry().await? {
                total += record.metadata().await?.len();
            }
        }
        Ok(total)
    }
}

async fn write_then_rename(tmp: &Path, path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    tokio::fs::write(tmp, contents).await?;
    tokio::fs::rename(tmp, path).await?;
    Ok(())
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
