use crate::error::{ImageError, Result};
use crate::file_store::{sanitize_file_name, FileStore};
use crate::model::ImageRecord;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use tracing::{debug, instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// A finished archive ready to be sent
#[derive(Debug)]
pub struct Archive {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub entries: usize,
}

/// Download name for an archive built at `at`, e.g. `images_20240115_103045.zip`
pub fn archive_name(at: DateTime<Utc>) -> String {
    format!("images_{}.zip", at.format("%Y%m%d_%H%M%S"))
}

/// Entry names for `records`: display name plus original extension,
/// with ` (n)` added before the extension when a name repeats
fn entry_names(records: &[ImageRecord]) -> Vec<String> {
    let mut used = HashSet::new();

    records
        .iter()
        .map(|record| {
            let stem = sanitize_file_name(&record.display_name);
            let ext = record.extension().map(|e| format!(".{e}")).unwrap_or_default();

            let mut name = format!("{stem}{ext}");
            let mut n = 1;
            while !used.insert(name.clone()) {
                name = format!("{stem} ({n}){ext}");
                n += 1;
            }
            name
        })
        .collect()
}

/// Build one zip archive holding the effective file of each record
///
/// Any unreadable file aborts the whole archive.
#[instrument(skip(files, records), fields(count = records.len()))]
pub async fn build_archive(files: &FileStore, records: &[ImageRecord]) -> Result<Archive> {
    let names = entry_names(records);

    let contents = try_join_all(records.iter().map(|r| files.read(r.effective_path()))).await?;

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    for (name, data) in names.iter().zip(&contents) {
        zip.start_file(name.as_str(), options)?;
        zip.write_all(data)
            .map_err(|e| ImageError::Archive(e.into()))?;
        debug!(entry = %name, size_bytes = data.len(), "Archive entry written");
    }

    let bytes = zip.finish()?.into_inner();

    Ok(Archive {
        file_name: archive_name(Utc::now()),
        bytes,
        entries: records.len(),
    })
}
