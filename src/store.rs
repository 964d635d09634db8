//! Durable, append-only registry of uploads
//!
//! Id assignment, artifact write, thumbnail attempt, append and snapshot
//! persistence all happen inside one exclusive section of the store lock.
//! Readers take the shared side of the same lock and never see a record
//! whose snapshot has not been written.
//!
//! Persistence rewrites the whole snapshot on every insert. That is fine at
//! catalog sizes of a few thousand entries; an append log with periodic
//! compaction would slot in behind `write_snapshot` if that stops holding.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::framing::validate_filename;
use crate::protocol::{Listing, THUMBNAIL_MAX};
use crate::thumbnail::Thumbnailer;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub id: u64,
    pub filename: String,
    pub uploader: String,
    #[serde(rename = "path")]
    pub storage_path: PathBuf,
    #[serde(rename = "thumb_path", default)]
    pub thumbnail_path: Option<PathBuf>,
    pub timestamp: String,
}

impl UploadRecord {
    pub fn listing(&self) -> Listing {
        Listing {
            filename: self.filename.clone(),
            uploader: self.uploader.clone(),
        }
    }
}

struct Catalog {
    records: Vec<UploadRecord>,
    // Independent of records.len() so ids stay unique if records ever go away
    next_id: u64,
}

pub struct MetadataStore {
    storage_dir: PathBuf,
    metadata_file: PathBuf,
    thumbnailer: Arc<dyn Thumbnailer>,
    catalog: RwLock<Catalog>,
}

impl MetadataStore {
    /// Load the persisted catalog. A missing file is an empty store; a file
    /// that does not parse is an error the caller must treat as fatal.
    pub fn open(
        storage_dir: &Path,
        metadata_file: &Path,
        thumbnailer: Arc<dyn Thumbnailer>,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(storage_dir)
            .map_err(|e| StoreError::io("create storage directory", storage_dir, e))?;

        let records: Vec<UploadRecord> = if metadata_file.exists() {
            let raw = std::fs::read_to_string(metadata_file)
                .map_err(|e| StoreError::io("read metadata", metadata_file, e))?;
            serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
                path: metadata_file.to_path_buf(),
                source,
            })?
        } else {
            Vec::new()
        };
        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        info!(
            records = records.len(),
            next_id,
            metadata = %metadata_file.display(),
            "metadata store loaded"
        );

        Ok(MetadataStore {
            storage_dir: storage_dir.to_path_buf(),
            metadata_file: metadata_file.to_path_buf(),
            thumbnailer,
            catalog: RwLock::new(Catalog { records, next_id }),
        })
    }

    /// Store a fully received upload and commit its record.
    pub async fn insert(
        &self,
        filename: &str,
        uploader: &str,
        payload: &[u8],
    ) -> Result<UploadRecord, StoreError> {
        let filename = validate_filename(filename)?;

        let mut catalog = self.catalog.write().await;
        let id = catalog.next_id;

        let storage_path = self.storage_dir.join(format!("{id}_{filename}"));
        tokio::fs::write(&storage_path, payload)
            .await
            .map_err(|e| StoreError::io("write artifact", &storage_path, e))?;

        // Thumbnailing and snapshot writes block; keep them off the runtime workers
        let thumb_target = self.storage_dir.join(format!("thumb_{id}_{filename}"));
        let thumbnailer = Arc::clone(&self.thumbnailer);
        let (source, target) = (storage_path.clone(), thumb_target.clone());
        let generated =
            tokio::task::spawn_blocking(move || thumbnailer.generate(&source, &target, THUMBNAIL_MAX))
                .await;
        let thumbnail_path = match generated {
            Ok(Ok(())) => Some(thumb_target),
            Ok(Err(e)) => {
                debug!(id, error = %e, "thumbnail skipped");
                None
            }
            Err(e) => {
                warn!(id, error = %e, "thumbnail task failed");
                None
            }
        };

        let record = UploadRecord {
            id,
            filename: filename.to_string(),
            uploader: uploader.to_string(),
            storage_path,
            thumbnail_path,
            timestamp: Utc::now().to_rfc3339(),
        };
        catalog.records.push(record.clone());

        let metadata_file = self.metadata_file.clone();
        let snapshot = catalog.records.clone();
        let written = tokio::task::spawn_blocking(move || write_snapshot(&metadata_file, &snapshot))
            .await
            .unwrap_or_else(|e| Err(StoreError::Task(e)));
        if let Err(e) = written {
            // Roll back so memory keeps matching the last good snapshot
            catalog.records.pop();
            let _ = tokio::fs::remove_file(&record.storage_path).await;
            if let Some(thumb) = &record.thumbnail_path {
                let _ = tokio::fs::remove_file(thumb).await;
            }
            warn!(id, error = %e, "metadata snapshot failed, upload rolled back");
            return Err(e);
        }
        catalog.next_id = id + 1;
        Ok(record)
    }

    /// Every record in commit order.
    pub async fn query_all(&self) -> Vec<UploadRecord> {
        self.catalog.read().await.records.clone()
    }

    /// The `{filename, uploader}` projection used by LIST.
    pub async fn listing(&self) -> Vec<Listing> {
        self.catalog
            .read()
            .await
            .records
            .iter()
            .map(UploadRecord::listing)
            .collect()
    }

    /// First record, by insertion order, with this filename.
    pub async fn query_by_filename(&self, filename: &str) -> Option<UploadRecord> {
        self.catalog
            .read()
            .await
            .records
            .iter()
            .find(|r| r.filename == filename)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.catalog.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Atomically replace the snapshot: write a sibling temp file, then rename.
fn write_snapshot(path: &Path, records: &[UploadRecord]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let data = serde_json::to_vec_pretty(records)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| StoreError::io("create snapshot temp file", &dir, e))?;
    if let Err(e) = tmp.write_all(&data).and_then(|_| tmp.flush()) {
        return Err(StoreError::io("write snapshot", &dir, e));
    }
    // Data must be on disk before the rename makes it the snapshot
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io("sync snapshot", &dir, e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io("replace metadata file", path, e.error))?;
    Ok(())
}
