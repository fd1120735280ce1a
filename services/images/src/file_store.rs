use crate::error::{ImageError, Result};
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Local file storage for uploads and annotated copies
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generate a storage path for an upload
    /// Format: {root}/{unix_nanos}-{random}.{ext}
    ///
    /// The timestamp keeps files roughly ordered by arrival; the random
    /// suffix keeps concurrent uploads in the same nanosecond apart.
    pub fn generate_path(&self, original_filename: &str) -> PathBuf {
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let suffix = &Uuid::new_v4().simple().to_string()[..8];

        let file_name = match sanitize_extension(original_filename) {
            Some(ext) => format!("{timestamp}-{suffix}.{ext}"),
            None => format!("{timestamp}-{suffix}"),
        };

        self.root.join(file_name)
    }

    /// Write an upload under a freshly generated path
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn save_upload(&self, original_filename: &str, data: &[u8]) -> Result<PathBuf> {
        self.ensure_root().await?;

        let path = self.generate_path(original_filename);
        fs::write(&path, data)
            .await
            .map_err(|e| ImageError::storage("write", &path, e))?;

        debug!(path = %path.display(), "Upload stored");
        Ok(path)
    }

    /// Copy an analyzer artifact into storage under a freshly generated path
    #[instrument(skip(self))]
    pub async fn copy_in(&self, source: &Path, original_filename: &str) -> Result<PathBuf> {
        self.ensure_root().await?;

        let path = self.generate_path(original_filename);
        fs::copy(source, &path)
            .await
            .map_err(|e| ImageError::storage("copy", source, e))?;

        debug!(source = %source.display(), path = %path.display(), "Annotated image stored");
        Ok(path)
    }

    /// Remove a stored file; a file that is already gone counts as removed
    #[instrument(skip(self))]
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "File removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "File already absent");
                Ok(())
            }
            Err(e) => Err(ImageError::storage("remove", path, e)),
        }
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
            .await
            .map_err(|e| ImageError::storage("read", path, e))
    }

    async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ImageError::storage("create directory", &self.root, e))
    }
}

/// Lowercased extension of `filename`, if it is plain alphanumeric
fn sanitize_extension(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?;
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Make a display name safe to use as a single path component
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            _ => c,
        })
        .collect()
}

/// Get content type for an image extension
pub fn content_type(extension: Option<&str>) -> &'static str {
    match extension.map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("gif") => "image/gif",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}
