// File utilities for the transcription job service
//
// This module contains the small filesystem helpers shared by the file-backed
// checkpoint store and the directory upload subsystem.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::{debug, error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Ensure a directory exists, creating parents as needed
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Write a value as JSON through a temporary file and a rename.
///
/// The rename is atomic on the same filesystem, so readers see either the
/// previous document or the new one, never a partial write.
///
/// # Errors
///
/// Returns an IO error if serialization, the temporary write, the fsync or the
/// rename fails. The temporary file is removed on failure.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let tmp_path = temp_sibling(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Read a JSON document, `Ok(None)` when the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Remove a file, treating "already gone" as success
pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed file: {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Clean up a folder and its contents
///
/// This function logs errors but doesn't return them to the caller
pub fn cleanup_folder(folder_path: &Path) {
    if let Err(e) = fs::remove_dir_all(folder_path) {
        error!("Failed to clean up folder {}: {}", folder_path.display(), e);
    } else {
        info!("Successfully cleaned up folder: {}", folder_path.display());
    }
}

/// Map an identifier to a file name that cannot escape its directory.
///
/// Plain ids (ASCII alphanumerics, `-` and `_`) are kept as written. Any other
/// id is stored as `~` followed by its URL-safe base64 form, so distinct ids
/// never share a file.
pub fn safe_file_name(id: &str, extension: &str) -> String {
    let plain = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        format!("{}.{}", id, extension)
    } else {
        format!("~{}.{}", URL_SAFE_NO_PAD.encode(id), extension)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u32,
    }

    #[test]
    fn test_atomic_write_replaces_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        write_json_atomic(&path, &Doc { value: 1 }).unwrap();
        write_json_atomic(&path, &Doc { value: 2 }).unwrap();

        let doc: Option<Doc> = read_json(&path).unwrap();
        assert_eq!(doc, Some(Doc { value: 2 }));

        // No temporary files left behind
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let doc: Option<Doc> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(doc.is_none());
        remove_file_if_exists(&dir.path().join("nope.json")).unwrap();
    }

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("abc-123", "json"), "abc-123.json");
        assert_eq!(safe_file_name("a_b", "json"), "a_b.json");
        assert_eq!(
            safe_file_name("../etc/passwd", "json"),
            "~Li4vZXRjL3Bhc3N3ZA.json"
        );
    }

    #[test]
    fn test_safe_file_names_are_distinct() {
        let ids = ["a b", "a/b", "a_b", "a.b", ".", "..", "", "~", "é"];
        let names: std::collections::HashSet<String> =
            ids.iter().map(|id| safe_file_name(id, "json")).collect();
        assert_eq!(names.len(), ids.len());
        for name in &names {
            assert!(!name.starts_with('.'), "{} would be hidden", name);
            assert!(!name.contains('/'), "{} leaves the directory", name);
        }
    }
}
