#![forbid(unsafe_code)]

//! Zip archives for code snapshots and job packets.

use crate::error::StoreError;
use std::fs::File;
use std::path::Path;
use zip::write::SimpleFileOptions;

/// Zip every file under `src` into `dest`, skipping top-level entries whose
/// names appear in `skip`. Entries are written in sorted order with a fixed
/// timestamp so identical trees produce identical archives.
///
/// Returns the number of files written.
pub fn zip_dir(src: &Path, dest: &Path, skip: &[&str]) -> Result<usize, StoreError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut files = Vec::new();
    collect(src, "", skip, &mut files)?;

    let mut writer = zip::ZipWriter::new(File::create(dest)?);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());
    for rel in &files {
        writer.start_file(rel.as_str(), options)?;
        let mut input = File::open(src.join(rel))?;
        std::io::copy(&mut input, &mut writer)?;
    }
    writer.finish()?;
    Ok(files.len())
}

fn collect(dir: &Path, rel: &str, skip: &[&str], out: &mut Vec<String>) -> Result<(), StoreError> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if rel.is_empty() && skip.contains(&name.as_str()) {
            continue;
        }
        let child = if rel.is_empty() {
            name
        } else {
            format!("{rel}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect(&entry.path(), &child, skip, out)?;
        } else if file_type.is_file() {
            out.push(child);
        }
    }
    Ok(())
}

/// Extract `archive` into `dest`, creating it if needed. Entries that would
/// escape `dest` are rejected by the archive reader.
pub fn unzip_into(archive: &Path, dest: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dest)?;
    let mut reader = zip::ZipArchive::new(File::open(archive)?)?;
    reader.extract(dest)?;
    Ok(())
}
