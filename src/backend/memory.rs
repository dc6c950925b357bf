use super::{normalize_path, Backend, BackendError, BackendResult, DirEntry, FileInfo};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

const KEEP_MARKER: &str = ".keep";

#[derive(Debug, Clone)]
struct FileData {
    content: Bytes,
    mtime: u32,
}

/// In-memory tenant filesystem, used by tests and embedders
pub struct MemoryBackend {
    files: RwLock<HashMap<String, FileData>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Create with pre-populated files
    pub fn with_files(files: HashMap<String, Vec<u8>>) -> Self {
        let mtime = super::current_timestamp();
        let files = files
            .into_iter()
            .map(|(k, content)| {
                (
                    normalize_path(&k),
                    FileData {
                        content: Bytes::from(content),
                        mtime,
                    },
                )
            })
            .collect();
        Self {
            files: RwLock::new(files),
        }
    }

    fn is_dir(files: &HashMap<String, FileData>, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        let prefix = format!("{}/", path);
        files.keys().any(|k| k.starts_with(&prefix))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list_dir(&self, path: &str) -> BackendResult<Vec<DirEntry>> {
        let normalized = normalize_path(path);
        let files = self.files.read();

        if files.contains_key(&normalized) {
            return Err(BackendError::NotADirectory);
        }
        if !Self::is_dir(&files, &normalized) {
            return Err(BackendError::NotFound);
        }

        let prefix = if normalized.is_empty() {
            String::new()
        } else {
            format!("{}/", normalized)
        };

        let mut seen = HashSet::new();
        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                attrs: FileInfo::directory(),
            },
            DirEntry {
                name: "..".to_string(),
                attrs: FileInfo::directory(),
            },
        ];

        for (key, data) in files.iter() {
            let Some(relative) = key.strip_prefix(&prefix) else {
                continue;
            };

            let name = relative.split('/').next().unwrap_or(relative);
            if name.is_empty() || name == KEEP_MARKER {
                continue;
            }

            if seen.insert(name.to_string()) {
                let attrs = if relative.contains('/') {
                    FileInfo::directory_with_mtime(data.mtime)
                } else {
                    FileInfo::file_with_mtime(data.content.len() as u64, data.mtime)
                };

                entries.push(DirEntry {
                    name: name.to_string(),
                    attrs,
                });
            }
        }

        Ok(entries)
    }

    async fn file_info(&self, path: &str) -> BackendResult<FileInfo> {
        let normalized = normalize_path(path);
        let files = self.files.read();

        if let Some(data) = files.get(&normalized) {
            return Ok(FileInfo::file_with_mtime(
                data.content.len() as u64,
                data.mtime,
            ));
        }

        if Self::is_dir(&files, &normalized) {
            return Ok(FileInfo::directory());
        }

        Err(BackendError::NotFound)
    }

    async fn make_dir(&self, path: &str) -> BackendResult<()> {
        let normalized = normalize_path(path);
        let mut files = self.files.write();
        if files.contains_key(&normalized) || Self::is_dir(&files, &normalized) {
            return Err(BackendError::AlreadyExists);
        }
        files.insert(
            format!("{}/{}", normalized, KEEP_MARKER),
            FileData {
                content: Bytes::new(),
                mtime: super::current_timestamp(),
            },
        );
        Ok(())
    }

    async fn del_dir(&self, path: &str) -> BackendResult<()> {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            return Err(BackendError::PermissionDenied);
        }
        let marker = format!("{}/{}", normalized, KEEP_MARKER);
        let prefix = format!("{}/", normalized);

        let mut files = self.files.write();
        if !Self::is_dir(&files, &normalized) {
            return Err(BackendError::NotFound);
        }
        if files.keys().any(|k| k.starts_with(&prefix) && *k != marker) {
            return Err(BackendError::DirectoryNotEmpty);
        }
        files.remove(&marker);
        Ok(())
    }

    async fn delete(&self, path: &str) -> BackendResult<()> {
        self.files
            .write()
            .remove(&normalize_path(path))
            .map(|_| ())
            .ok_or(BackendError::NotFound)
    }

    async fn rename(&self, src: &str, dst: &str) -> BackendResult<()> {
        let src_key = normalize_path(src);
        let dst_key = normalize_path(dst);

        let mut files = self.files.write();
        let data = files.remove(&src_key).ok_or(BackendError::NotFound)?;
        files.insert(dst_key, data);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> BackendResult<Bytes> {
        let normalized = normalize_path(path);
        let files = self.files.read();
        match files.get(&normalized) {
            Some(data) => Ok(data.content.clone()),
            None if Self::is_dir(&files, &normalized) => Err(BackendError::IsADirectory),
            None => Err(BackendError::NotFound),
        }
    }

    async fn write_file(&self, path: &str, content: Bytes) -> BackendResult<()> {
        let normalized = normalize_path(path);
        let mut files = self.files.write();
        if Self::is_dir(&files, &normalized) {
            return Err(BackendError::IsADirectory);
        }
        files.insert(
            normalized,
            FileData {
                content,
                mtime: super::current_timestamp(),
            },
        );
        Ok(())
    }
}
