//! Local filesystem artifact storage
//!
//! Uploads are stored as `<uuid>_<sanitized name>` in the upload directory,
//! MIDI outputs as `<task_id>.mid` in the output directory.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConversionError, Result};

/// Input extensions kept as-is by [`sanitize_filename`]
const SUPPORTED_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "ogg", "m4a"];

const MAX_FILENAME_LEN: usize = 255;

/// Upload and output file store
#[derive(Debug, Clone)]
pub struct FileStore {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl FileStore {
    pub fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Create both directories if missing
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.upload_dir, &self.output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| storage_err("create directory", dir, e))?;
        }
        Ok(())
    }

    /// Store uploaded bytes under a unique name; returns the stored path
    pub async fn save_upload(&self, content: &[u8], original_filename: &str) -> Result<PathBuf> {
        let path = self.unique_upload_path(original_filename);
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|e| storage_err("create directory", &self.upload_dir, e))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| storage_err("write upload", &path, e))?;

        info!(path = %path.display(), bytes = content.len(), "Upload saved");
        Ok(path)
    }

    /// Copy an existing local file into the upload directory
    pub async fn import_upload(&self, source: &Path, original_filename: &str) -> Result<PathBuf> {
        let path = self.unique_upload_path(original_filename);
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|e| storage_err("create directory", &self.upload_dir, e))?;
        let bytes = tokio::fs::copy(source, &path)
            .await
            .map_err(|e| storage_err("copy upload", source, e))?;

        info!(source = %source.display(), path = %path.display(), bytes, "Upload imported");
        Ok(path)
    }

    /// Write the MIDI artifact for `task_id`
    ///
    /// Written to a temporary name first and renamed, so a reader never sees a
    /// partial file.
    pub async fn save_output(&self, task_id: Uuid, content: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| storage_err("create directory", &self.output_dir, e))?;

        let path = self.output_path(task_id);
        let partial = path.with_extension("mid.part");
        tokio::fs::write(&partial, content)
            .await
            .map_err(|e| storage_err("write output", &partial, e))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| storage_err("rename output", &path, e))?;

        info!(task_id = %task_id, path = %path.display(), bytes = content.len(), "Output saved");
        Ok(path)
    }

    /// Output location for a task, whether or not it exists
    pub fn output_path(&self, task_id: Uuid) -> PathBuf {
        self.output_dir.join(format!("{}.mid", task_id))
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| storage_err("read", path, e))?;
        debug!(path = %path.display(), bytes = content.len(), "File read");
        Ok(content)
    }

    /// Delete a file; `Ok(false)` when it was already gone
    pub async fn delete(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "File deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "File not found for deletion");
                Ok(false)
            }
            Err(e) => Err(storage_err("delete", path, e)),
        }
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn size(&self, path: &Path) -> Result<u64> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| storage_err("stat", path, e))?;
        Ok(metadata.len())
    }

    fn unique_upload_path(&self, original_filename: &str) -> PathBuf {
        self.upload_dir
            .join(format!("{}_{}", Uuid::new_v4(), sanitize_filename(original_filename)))
    }
}

/// Reduce a client-supplied filename to a safe single path component
///
/// Path components and reserved characters are stripped, unsupported
/// extensions get `.mp3` appended, and the result is capped at 255 bytes.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .replace("..", "_");

    let mut name: String = base
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if name.trim_matches(['_', '.', ' ']).is_empty() {
        return "unknown.mp3".to_string();
    }

    let has_supported_ext = Path::new(&name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if !has_supported_ext {
        name.push_str(".mp3");
    }

    if name.len() > MAX_FILENAME_LEN {
        let (stem, ext) = match name.rfind('.') {
            Some(idx) => (&name[..idx], &name[idx..]),
            None => (name.as_str(), ""),
        };
        let mut keep = MAX_FILENAME_LEN.saturating_sub(ext.len());
        while !stem.is_char_boundary(keep) {
            keep -= 1;
        }
        name = format!("{}{}", &stem[..keep], ext);
    }

    name
}

fn storage_err(action: &str, path: &Path, err: std::io::Error) -> ConversionError {
    ConversionError::Storage(format!("Failed to {} {}: {}", action, path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_path_components() {
        assert_eq!(sanitize_filename("../../etc/passwd.mp3"), "passwd.mp3");
        assert_eq!(sanitize_filename("C:\\music\\song.mp3"), "song.mp3");
    }

    #[test]
    fn test_sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_filename("what?*.mp3"), "what__.mp3");
        assert_eq!(sanitize_filename("a..b.wav"), "a_b.wav");
    }

    #[test]
    fn test_sanitize_appends_extension_and_handles_empty() {
        assert_eq!(sanitize_filename("recording"), "recording.mp3");
        assert_eq!(sanitize_filename("notes.txt"), "notes.txt.mp3");
        assert_eq!(sanitize_filename(""), "unknown.mp3");
        assert_eq!(sanitize_filename("///"), "unknown.mp3");
    }

    #[test]
    fn test_sanitize_caps_length_keeping_extension() {
        let long = format!("{}.mp3", "x".repeat(400));
        let clean = sanitize_filename(&long);
        assert_eq!(clean.len(), MAX_FILENAME_LEN);
        assert!(clean.ends_with(".mp3"));
    }

    #[tokio::test]
    async fn test_upload_and_output_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("up"), dir.path().join("out"));
        store.ensure_dirs().await.unwrap();

        let upload = store.save_upload(b"ID3", "my song.mp3").await.unwrap();
        let name = upload.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_my song.mp3"));
        assert_eq!(store.read(&upload).await.unwrap(), b"ID3");

        let task_id = Uuid::new_v4();
        let output = store.save_output(task_id, b"MThd").await.unwrap();
        assert_eq!(output, store.output_path(task_id));
        assert_eq!(store.size(&output).await.unwrap(), 4);
        assert!(!store.exists(&output.with_extension("mid.part")).await);

        assert!(store.delete(&output).await.unwrap());
        assert!(!store.delete(&output).await.unwrap());
        assert!(!store.exists(&output).await);
    }

    #[tokio::test]
    async fn test_two_uploads_with_same_name_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("up"), dir.path().join("out"));
        let a = store.save_upload(b"a", "same.mp3").await.unwrap();
        let b = store.save_upload(b"b", "same.mp3").await.unwrap();
        assert_ne!(a, b);
    }
}
