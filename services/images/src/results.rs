//! Decoding and grouping of analyzer output.
//!
//! The analyzer writes one JSON document per run:
//!
//! ```json
//! {"results": [{"detections": [
//!     {"class_name": "cat", "confidence": 0.9,
//!      "bounding_box": {"x_min": 0, "x_max": 10, "y_min": 0, "y_max": 10}}
//! ]}]}
//! ```

use crate::error::DetectionError;
use crate::model::{BoundingBox, DetectedObjectGroup};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct AnalyzerOutput {
    results: Vec<AnalyzerResult>,
}

#[derive(Debug, Deserialize)]
struct AnalyzerResult {
    detections: Vec<RawDetection>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    class_name: String,
    confidence: f32,
    bounding_box: RawBox,
}

#[derive(Debug, Deserialize)]
struct RawBox {
    #[serde(deserialize_with = "pixel")]
    x_min: i32,
    #[serde(deserialize_with = "pixel")]
    x_max: i32,
    #[serde(deserialize_with = "pixel")]
    y_min: i32,
    #[serde(deserialize_with = "pixel")]
    y_max: i32,
}

/// Pixel coordinates arrive as integers or floats; floats truncate toward zero
fn pixel<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < i32::MIN as f64 || value > i32::MAX as f64 {
        return Err(serde::de::Error::custom(format!(
            "coordinate out of range: {value}"
        )));
    }
    Ok(value.trunc() as i32)
}

/// Read and aggregate an analyzer result file
pub async fn read_detections(path: &Path) -> Result<Vec<DetectedObjectGroup>, DetectionError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| DetectionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    parse_detections(&bytes)
}

/// Decode an analyzer document and group its detections by class name
///
/// Groups are sorted by class name; boxes keep the order they appear in
/// the document.
pub fn parse_detections(bytes: &[u8]) -> Result<Vec<DetectedObjectGroup>, DetectionError> {
    let output: AnalyzerOutput = serde_json::from_slice(bytes)?;

    let mut groups: BTreeMap<String, Vec<BoundingBox>> = BTreeMap::new();

    for detection in output.results.into_iter().flat_map(|r| r.detections) {
        let bbox = into_bounding_box(&detection)?;
        groups.entry(detection.class_name).or_default().push(bbox);
    }

    Ok(groups
        .into_iter()
        .map(|(class_name, boxes)| DetectedObjectGroup { class_name, boxes })
        .collect())
}

fn into_bounding_box(detection: &RawDetection) -> Result<BoundingBox, DetectionError> {
    let b = &detection.bounding_box;

    if !(0.0..=1.0).contains(&detection.confidence) {
        return Err(DetectionError::Malformed(format!(
            "{} confidence {} outside [0, 1]",
            detection.class_name, detection.confidence
        )));
    }
    if b.x_min > b.x_max || b.y_min > b.y_max {
        return Err(DetectionError::Malformed(format!(
            "{} box [{}, {}, {}, {}] has inverted corners",
            detection.class_name, b.x_min, b.y_min, b.x_max, b.y_max
        )));
    }

    Ok(BoundingBox {
        id: Uuid::new_v4(),
        confidence: detection.confidence,
        x_min: b.x_min,
        x_max: b.x_max,
        y_min: b.y_min,
        y_max: b.y_max,
    })
}
