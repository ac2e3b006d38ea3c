use std::path::{Path, PathBuf};

use common::FileInfo;

use crate::error::{MeshError, Result};

/// File served in place of a directory.
pub const DIRECTORY_INDEX: &str = "agent.index.html";

/// Files this agent serves and downloads into, rooted at one directory.
/// Locations are `/`-separated paths relative to the root.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the store at `root`. An unusable root is a
    /// configuration error.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .and_then(|_| root.canonicalize())
            .map(|root| Self { root })
            .map_err(|e| MeshError::Configuration(format!("files path {}: {e}", root.display())))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a new file at `location` should be written to; parent directories
    /// are created.
    pub fn target_file(&self, location: &str) -> Result<PathBuf> {
        let rel = sanitize(location)
            .ok_or_else(|| MeshError::Validation(format!("invalid location {location:?}")))?;
        let target = self.root.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MeshError::Validation(format!("error saving file to {}: {e}", target.display()))
            })?;
        }
        Ok(target)
    }

    /// Existing regular file for `location`, or `None` for anything unsafe,
    /// missing or not a file. Directories resolve to their index file.
    pub fn file_by_location(&self, location: &str) -> Option<PathBuf> {
        let rel = sanitize(location)?;
        let mut target = self.root.join(rel);
        if !target.exists() {
            return None;
        }
        // symlinks must not lead out of the root
        let resolved = target.canonicalize().ok()?;
        if !resolved.starts_with(&self.root) {
            return None;
        }
        if resolved.is_dir() {
            target = resolved.join(DIRECTORY_INDEX);
        }
        target.is_file().then_some(target)
    }

    pub fn file_info(&self, location: &str) -> Option<FileInfo> {
        let path = self.file_by_location(location)?;
        let meta = std::fs::metadata(&path).ok()?;
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Some(FileInfo {
            agent_id: None,
            location: location.trim_start_matches('/').to_string(),
            length: meta.len(),
            last_modified,
        })
    }
}

/// Whether `location` names a path inside a store.
pub fn is_valid_location(location: &str) -> bool {
    sanitize(location).is_some()
}

/// Relative path for a location, rejecting anything that could escape the
/// root or that carries markup characters.
fn sanitize(location: &str) -> Option<PathBuf> {
    let location = location.trim_start_matches('/');
    if location.is_empty() || location.contains(['<', '>', '&', '"', '\\', '\0']) {
        return None;
    }
    let mut rel = PathBuf::new();
    for segment in location.split('/').filter(|s| !s.is_empty()) {
        if segment.starts_with('.') || segment.ends_with('.') {
            return None;
        }
        rel.push(segment);
    }
    (!rel.as_os_str().is_empty()).then_some(rel)
}
