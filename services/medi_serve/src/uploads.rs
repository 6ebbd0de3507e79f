//! Flat directory of uploaded images and generated artifacts

use std::fs::{create_dir_all, write};
use std::path::{Path, PathBuf};

use crate::error::ServeError;

/// URL prefix the uploads directory is served under.
pub const URL_PREFIX: &str = "uploads";

/// Files are keyed by sanitized name; a second upload under the same name
/// replaces the first.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, ServeError> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir)
            .map_err(|e| ServeError::Upload(format!("create_dir_all {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keep only the final path component and a conservative character set.
    pub fn sanitize(name: &str) -> String {
        let base = name.rsplit(['/', '\\']).next().unwrap_or("");
        let mut fname = String::with_capacity(base.len());
        for ch in base.chars() {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                fname.push(ch);
            } else {
                fname.push('_');
            }
        }
        let fname = fname.trim_start_matches('.');
        if fname.is_empty() {
            "upload".to_string()
        } else {
            fname.to_string()
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Write `bytes` under the sanitized `name` and return the stored name.
    pub fn save(&self, name: &str, bytes: &[u8]) -> Result<String, ServeError> {
        let fname = Self::sanitize(name);
        let path = self.path_for(&fname);
        write(&path, bytes)
            .map_err(|e| ServeError::Upload(format!("write {}: {e}", path.display())))?;
        Ok(fname)
    }

    pub fn url_for(name: &str) -> String {
        format!("{URL_PREFIX}/{name}")
    }
}

/// File name without its last extension.
pub fn stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(i) if i > 0 => &name[..i],
        _ => name,
    }
}
