use crate::detector::{locate_annotated_image, Analyzer};
use crate::error::{ImageError, Result};
use crate::export::{build_archive, Archive};
use crate::file_store::{content_type, sanitize_file_name, FileStore};
use crate::model::{DetectedObjectGroup, ImageRecord, ImageStatus, OwnerId, DEFAULT_DISPLAY_NAME};
use crate::query::ImageFilter;
use crate::results::read_detections;
use crate::store::ImageStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// An uploaded file as received from the client
#[derive(Debug, Clone)]
pub struct Upload {
    /// Client-side file name, used only for its extension
    pub file_name: String,
    pub data: Vec<u8>,
}

/// A single record's deliverable, ready to stream
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub file_name: String,
    pub content_type: &'static str,
}

/// Image workflows: upload and detection, plus owner-scoped record operations
pub struct ImageService {
    store: Arc<dyn ImageStore>,
    analyzer: Arc<dyn Analyzer>,
    files: FileStore,
}

/// Reject `owner` unless it created `record`
pub fn ensure_owner(record: &ImageRecord, owner: OwnerId) -> Result<()> {
    if record.is_owned_by(owner) {
        Ok(())
    } else {
        Err(ImageError::NotOwner(record.id))
    }
}

/// Parse a client-supplied record id
pub fn parse_image_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ImageError::InvalidInput(format!("Invalid image ID: {raw}")))
}

/// Parse every id of a batch request, failing on the first invalid one
pub fn parse_image_ids(raw: &[String]) -> Result<Vec<Uuid>> {
    raw.iter().map(|id| parse_image_id(id)).collect()
}

impl ImageService {
    pub fn new(store: Arc<dyn ImageStore>, analyzer: Arc<dyn Analyzer>, files: FileStore) -> Self {
        Self {
            store,
            analyzer,
            files,
        }
    }

    pub fn store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Store an upload, run detection on it and record the outcome
    ///
    /// The record is inserted as pending before detection starts and is
    /// never removed by a later failure: detection or output problems mark
    /// it failed, and the error is returned to the caller.
    #[instrument(skip(self, upload), fields(owner = %owner, file_name = %upload.file_name))]
    pub async fn create_image(
        &self,
        owner: OwnerId,
        upload: Upload,
        display_name: Option<String>,
    ) -> Result<ImageRecord> {
        if upload.data.is_empty() {
            return Err(ImageError::InvalidInput("Uploaded image is empty".to_string()));
        }

        let display_name = display_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());

        let stored_path = self.files.save_upload(&upload.file_name, &upload.data).await?;

        let mut record = ImageRecord::pending(owner, display_name, stored_path);
        if let Err(e) = self.store.insert(&record).await {
            // Nothing references the file yet
            if let Err(cleanup) = self.files.remove(&record.stored_path).await {
                warn!(error = %cleanup, "Failed to remove unreferenced upload");
            }
            return Err(e.into());
        }

        metrics::counter!("images.uploaded").increment(1);
        info!(image_id = %record.id, "Image stored, running detection");

        let (detected_path, detections) = match self.detect(&record, &upload.file_name).await {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::counter!("images.detection.failed").increment(1);
                error!(image_id = %record.id, error = %e, "Detection failed");
                if let Err(update) = self.store.mark_failed(record.id).await {
                    error!(image_id = %record.id, error = %update, "Failed to mark image as failed");
                }
                return Err(e);
            }
        };

        if let Err(e) = self
            .store
            .complete(record.id, &detected_path, &detections)
            .await
        {
            // The record stays pending for the reconciler; drop the copy it never saw
            error!(image_id = %record.id, error = %e, "Failed to record detection result");
            if let Err(cleanup) = self.files.remove(&detected_path).await {
                warn!(error = %cleanup, "Failed to remove unreferenced annotated image");
            }
            return Err(e.into());
        }

        metrics::counter!("images.detection.succeeded").increment(1);

        record.status = ImageStatus::Success;
        record.detected_path = Some(detected_path);
        record.detections = detections;

        info!(
            image_id = %record.id,
            groups = record.detections.len(),
            "Detection recorded"
        );

        Ok(record)
    }

    /// Run the analyzer and collect its results and annotated image
    async fn detect(
        &self,
        record: &ImageRecord,
        original_file_name: &str,
    ) -> Result<(PathBuf, Vec<DetectedObjectGroup>)> {
        let run = self.analyzer.analyze(&record.stored_path).await?;
        let detections = read_detections(&run.result_file).await?;
        let annotated = locate_annotated_image(&run.output_dir, &record.stored_path).await?;

        let detected_path = self
            .files
            .copy_in(&annotated, &format!("detected_{original_file_name}"))
            .await?;

        Ok((detected_path, detections))
    }

    /// List one owner's records
    #[instrument(skip(self))]
    pub async fn list_images(&self, owner: OwnerId, filter: &ImageFilter) -> Result<Vec<ImageRecord>> {
        Ok(self.store.list(owner, filter).await?)
    }

    /// Load a record and check `owner` may act on it
    pub async fn owned_image(&self, owner: OwnerId, id: Uuid) -> Result<ImageRecord> {
        let record = self.store.get(id).await?.ok_or(ImageError::NotFound(id))?;
        ensure_owner(&record, owner)?;
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn rename_image(&self, owner: OwnerId, id: Uuid, name: &str) -> Result<()> {
        self.owned_image(owner, id).await?;

        let name = name.trim();
        if name.is_empty() {
            return Err(ImageError::InvalidInput("Image name is required".to_string()));
        }

        self.store.rename(id, name).await?;
        info!(image_id = %id, "Image renamed");
        Ok(())
    }

    /// The effective file of a record, named for the client
    #[instrument(skip(self))]
    pub async fn download_image(&self, owner: OwnerId, id: Uuid) -> Result<Download> {
        let record = self.owned_image(owner, id).await?;

        let mut file_name = sanitize_file_name(&record.file_name());
        if record.has_detected_copy() {
            file_name = format!("detected_{file_name}");
        }

        Ok(Download {
            path: record.effective_path().to_path_buf(),
            file_name,
            content_type: content_type(record.extension()),
        })
    }

    /// Delete a record and its files
    ///
    /// Files go first; if any removal fails the record is kept.
    #[instrument(skip(self))]
    pub async fn delete_image(&self, owner: OwnerId, id: Uuid) -> Result<()> {
        let record = self.owned_image(owner, id).await?;

        self.remove_files(&record).await?;

        if !self.store.delete(id).await.map_err(|e| {
            error!(image_id = %id, error = %e, "Files removed but record delete failed");
            e
        })? {
            return Err(ImageError::NotFound(id));
        }

        metrics::counter!("images.deleted").increment(1);
        info!(image_id = %id, "Image deleted");
        Ok(())
    }

    /// Delete every record among `ids` owned by `owner`; returns the count
    ///
    /// Stops at the first file that cannot be removed, before any record is
    /// deleted.
    #[instrument(skip(self, ids), fields(requested = ids.len()))]
    pub async fn delete_images(&self, owner: OwnerId, ids: &[Uuid]) -> Result<u64> {
        let records = self.store.find_owned(owner, ids).await?;

        for record in &records {
            self.remove_files(record).await?;
        }

        let owned_ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let deleted = self.store.delete_owned(owner, &owned_ids).await?;

        metrics::counter!("images.deleted").increment(deleted);
        info!(deleted, "Images deleted");
        Ok(deleted)
    }

    async fn remove_files(&self, record: &ImageRecord) -> Result<()> {
        for path in record.files() {
            self.files.remove(path).await?;
        }
        Ok(())
    }

    /// Build an archive of the owner's records among `ids`
    #[instrument(skip(self, ids), fields(requested = ids.len()))]
    pub async fn export_images(&self, owner: OwnerId, ids: &[Uuid]) -> Result<Archive> {
        let records = self.store.find_owned(owner, ids).await?;
        let archive = build_archive(&self.files, &records).await?;

        metrics::counter!("images.exported").increment(archive.entries as u64);
        info!(entries = archive.entries, size_bytes = archive.bytes.len(), "Archive built");
        Ok(archive)
    }
}
