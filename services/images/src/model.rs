use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Display name given to uploads that arrive without one
pub const DEFAULT_DISPLAY_NAME: &str = "untitled";

/// Identity of an authenticated user, as forwarded by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub Uuid);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Detection status of an image record
///
/// Records start `Pending` and move exactly once to `Success` or `Fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Success,
    Fail,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Success => "success",
            ImageStatus::Fail => "fail",
        }
    }

    /// Only pending -> success and pending -> fail are allowed
    pub fn can_transition_to(&self, next: ImageStatus) -> bool {
        matches!(
            (self, next),
            (ImageStatus::Pending, ImageStatus::Success) | (ImageStatus::Pending, ImageStatus::Fail)
        )
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ImageStatus::Pending),
            "success" => Ok(ImageStatus::Success),
            "fail" => Ok(ImageStatus::Fail),
            other => Err(format!("unknown image status: {other}")),
        }
    }
}

/// One detected bounding box, in pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub id: Uuid,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
    pub x_min: i32,
    pub x_max: i32,
    pub y_min: i32,
    pub y_max: i32,
}

/// All boxes sharing one class label within a single image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedObjectGroup {
    pub class_name: String,
    pub boxes: Vec<BoundingBox>,
}

/// A persisted upload and its detection outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: Uuid,
    pub owner: OwnerId,
    pub display_name: String,
    pub stored_path: PathBuf,
    /// Annotated copy written by the analyzer; `null` until detection succeeds
    pub detected_path: Option<PathBuf>,
    pub status: ImageStatus,
    pub detections: Vec<DetectedObjectGroup>,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// New pending record for a freshly stored upload
    pub fn pending(owner: OwnerId, display_name: impl Into<String>, stored_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            display_name: display_name.into(),
            stored_path,
            detected_path: None,
            status: ImageStatus::Pending,
            detections: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_owned_by(&self, owner: OwnerId) -> bool {
        self.owner == owner
    }

    /// The file to serve or export: the annotated copy if present, else the upload
    pub fn effective_path(&self) -> &Path {
        self.detected_path.as_deref().unwrap_or(&self.stored_path)
    }

    pub fn has_detected_copy(&self) -> bool {
        self.detected_path.is_some()
    }

    /// Extension of the original upload, without the leading dot
    pub fn extension(&self) -> Option<&str> {
        self.stored_path.extension().and_then(|ext| ext.to_str())
    }

    /// Display name plus the original extension, e.g. `cat.jpg`
    pub fn file_name(&self) -> String {
        match self.extension() {
            Some(ext) => format!("{}.{}", self.display_name, ext),
            None => self.display_name.clone(),
        }
    }

    /// Every file this record owns on disk
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.stored_path.as_path()).chain(self.detected_path.as_deref())
    }
}
