//! Artifact sink implementation.

use super::{ArtifactInfo, PersistOutcome, RecordSink};
use crate::error::{FeedError, Result};
use crate::types::{ChangeRecord, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Magic bytes for artifact files.
const ARTIFACT_MAGIC: &[u8; 4] = b"ART\0";

/// Current artifact format version.
const ARTIFACT_VERSION: u8 = 1;

/// Magic, version, length prefix and trailing checksum.
const FRAME_OVERHEAD: u64 = 4 + 1 + 8 + 4;

/// File extension of artifacts.
pub const ARTIFACT_EXTENSION: &str = "rec";

/// Body of an artifact file.
#[derive(Serialize, Deserialize)]
struct StoredArtifact {
    captured_at: Timestamp,
    record: ChangeRecord,
}

/// Deterministic artifact name for a record captured at `captured_at`.
pub fn artifact_name(record: &ChangeRecord, captured_at: Timestamp) -> String {
    format!(
        "{}_v{}_{}.{}",
        record.entity_id,
        record.order_version,
        captured_at.compact_utc(),
        ARTIFACT_EXTENSION
    )
}

/// Writes records as checksummed MessagePack artifacts in one directory.
pub struct ArtifactSink {
    /// Directory holding the artifacts.
    path: PathBuf,

    /// LRU cache for recently read artifacts.
    cache: Mutex<LruCache<String, ChangeRecord>>,
}

impl ArtifactSink {
    /// Create a sink writing into `path`.
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Directory holding the artifacts.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a record with an explicit capture time.
    pub fn persist_at(&self, record: &ChangeRecord, captured_at: Timestamp) -> PersistOutcome {
        let name = artifact_name(record, captured_at);
        match self.write_artifact(&name, record, captured_at) {
            Ok(size) => {
                self.cache.lock().put(name.clone(), record.clone());
                PersistOutcome::Saved { name, size }
            }
            Err(e) => {
                warn!(artifact = %name, error = %e, "failed to persist artifact");
                PersistOutcome::Failed {
                    name,
                    error: e.to_string(),
                }
            }
        }
    }

    fn write_artifact(
        &self,
        name: &str,
        record: &ChangeRecord,
        captured_at: Timestamp,
    ) -> Result<u64> {
        let body = rmp_serde::to_vec_named(&StoredArtifact {
            captured_at,
            record: record.clone(),
        })?;

        let final_path = self.path.join(name);
        let tmp_path = self.path.join(format!(".{}.tmp", name));

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(ARTIFACT_MAGIC)?;
            file.write_all(&[ARTIFACT_VERSION])?;
            file.write_all(&(body.len() as u64).to_le_bytes())?;
            file.write_all(&body)?;
            file.write_all(&crc32fast::hash(&body).to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &final_path)?;

        Ok(FRAME_OVERHEAD + body.len() as u64)
    }

    fn read_artifact(path: &Path) -> Result<StoredArtifact> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ARTIFACT_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid artifact magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ARTIFACT_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported artifact version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        let available = file.metadata()?.len().saturating_sub(FRAME_OVERHEAD);
        if len > available {
            return Err(FeedError::InvalidFormat(format!(
                "artifact body length {} exceeds the {} bytes on disk",
                len, available
            )));
        }

        let mut body = vec![0u8; len as usize];
        file.read_exact(&mut body)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&body);
        if stored_checksum != computed_checksum {
            return Err(FeedError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok(rmp_serde::from_slice(&body)?)
    }

    fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && name.ends_with(&format!(".{}", ARTIFACT_EXTENSION));
        if valid {
            Ok(())
        } else {
            Err(FeedError::InvalidArtifactName(name.to_string()))
        }
    }
}

fn to_timestamp(time: SystemTime) -> Timestamp {
    let micros = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    Timestamp(micros)
}

impl RecordSink for ArtifactSink {
    fn persist(&self, record: &ChangeRecord) -> PersistOutcome {
        self.persist_at(record, Timestamp::now())
    }

    fn list(&self) -> Result<Vec<ArtifactInfo>> {
        let mut artifacts = Vec::new();
        let suffix = format!(".{}", ARTIFACT_EXTENSION);

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with('.') || !filename.ends_with(&suffix) {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let created = metadata.created().or_else(|_| metadata.modified())?;
            artifacts.push(ArtifactInfo {
                filename,
                size: metadata.len(),
                created: to_timestamp(created),
            });
        }

        artifacts.sort_by(|a, b| {
            b.created
                .cmp(&a.created)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(artifacts)
    }

    fn read(&self, name: &str) -> Result<ChangeRecord> {
        Self::validate_name(name)?;

        if let Some(cached) = self.cache.lock().get(name).cloned() {
            return Ok(cached);
        }

        let path = self.path.join(name);
        if !path.is_file() {
            return Err(FeedError::ArtifactNotFound(name.to_string()));
        }

        let stored = Self::read_artifact(&path)?;
        self.cache.lock().put(name.to_string(), stored.record.clone());
        Ok(stored.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn invoice(version: u64, id: u64) -> ChangeRecord {
        ChangeRecord::new(version, id)
            .with_field("invoiceNumber", json!(format!("INV-{:04}", id)))
            .with_field("totalAmount", json!(125.5))
            .with_field("lines", json!([{"sku": "A-1", "qty": 2}]))
    }

    #[test]
    fn test_artifact_name_is_deterministic() {
        let ts = Timestamp(1_704_164_645 * 1_000_000);
        let record = invoice(5, 13);
        assert_eq!(artifact_name(&record, ts), "13_v5_20240102_030405.rec");
        assert_eq!(artifact_name(&record, ts), artifact_name(&record, ts));
    }

    #[test]
    fn test_persist_and_read() {
        let dir = TempDir::new().unwrap();
        let sink = ArtifactSink::new(dir.path().join("processed"), 16).unwrap();

        let record = invoice(3, 42);
        let outcome = sink.persist(&record);
        assert!(outcome.is_saved());

        // Bypass the cache by reading through a fresh sink.
        let fresh = ArtifactSink::new(dir.path().join("processed"), 16).unwrap();
        let read = fresh.read(outcome.name()).unwrap();
        assert_eq!(read, record);
        assert_eq!(read.fields["lines"][0]["qty"], 2);
    }

    #[test]
    fn test_overwrite_same_name_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sink = ArtifactSink::new(dir.path(), 16).unwrap();
        let ts = Timestamp(1_700_000_000 * 1_000_000);

        let record = invoice(1, 1);
        assert!(sink.persist_at(&record, ts).is_saved());
        assert!(sink.persist_at(&record, ts).is_saved());

        assert_eq!(sink.list().unwrap().len(), 1);
        assert_eq!(sink.read(&artifact_name(&record, ts)).unwrap(), record);
    }

    #[test]
    fn test_list_reports_sizes() {
        let dir = TempDir::new().unwrap();
        let sink = ArtifactSink::new(dir.path(), 16).unwrap();
        let ts = Timestamp(1_700_000_000 * 1_000_000);

        sink.persist_at(&invoice(1, 1), ts);
        sink.persist_at(&invoice(2, 2), ts);
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let listed = sink.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|a| a.size > 0));

        let mean = listed.iter().map(|a| a.size).sum::<u64>() / 2;
        assert_eq!(sink.average_size(10).unwrap(), Some(mean));
        assert_eq!(sink.average_size(1).unwrap(), Some(listed[0].size));
    }

    #[test]
    fn test_average_size_of_empty_sink() {
        let dir = TempDir::new().unwrap();
        let sink = ArtifactSink::new(dir.path(), 16).unwrap();
        assert_eq!(sink.average_size(10).unwrap(), None);
    }

    #[test]
    fn test_read_missing_and_invalid_names() {
        let dir = TempDir::new().unwrap();
        let sink = ArtifactSink::new(dir.path(), 16).unwrap();

        assert!(matches!(
            sink.read("1_v1_20240101_000000.rec"),
            Err(FeedError::ArtifactNotFound(_))
        ));
        assert!(matches!(
            sink.read("../cursors.rec"),
            Err(FeedError::InvalidArtifactName(_))
        ));
        assert!(matches!(
            sink.read("report.json"),
            Err(FeedError::InvalidArtifactName(_))
        ));
    }

    #[test]
    fn test_checksum_verified() {
        let dir = TempDir::new().unwrap();
        let sink = ArtifactSink::new(dir.path(), 16).unwrap();
        let outcome = sink.persist(&invoice(1, 1));

        let path = dir.path().join(outcome.name());
        let mut bytes = fs::read(&path).unwrap();
        let idx = bytes.len() - 6;
        bytes[idx] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let fresh = ArtifactSink::new(dir.path(), 16).unwrap();
        assert!(matches!(
            fresh.read(outcome.name()),
            Err(FeedError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_length_header_rejected() {
        let dir = TempDir::new().unwrap();
        let sink = ArtifactSink::new(dir.path(), 16).unwrap();
        let outcome = sink.persist(&invoice(1, 1));

        let path = dir.path().join(outcome.name());
        let mut bytes = fs::read(&path).unwrap();
        bytes[5..13].copy_from_slice(&(1u64 << 40).to_le_bytes());
        fs::write(&path, bytes).unwrap();

        let fresh = ArtifactSink::new(dir.path(), 16).unwrap();
        assert!(matches!(
            fresh.read(outcome.name()),
            Err(FeedError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_persist_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let sink = ArtifactSink::new(dir.path().join("gone"), 16).unwrap();
        fs::remove_dir_all(dir.path().join("gone")).unwrap();

        let outcome = sink.persist(&invoice(1, 1));
        assert!(matches!(outcome, PersistOutcome::Failed { .. }));
    }
}
