use async_trait::async_trait;
use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod local;
pub mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur in backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("File or directory not found")]
    NotFound,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("File already exists")]
    AlreadyExists,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Is a directory")]
    IsADirectory,
    #[error("Directory not empty")]
    DirectoryNotEmpty,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Backend error: {0}")]
    Other(String),
}

/// Directory entry returned by list_dir
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attrs: FileInfo,
}

/// File metadata information
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub size: u64,
    pub is_dir: bool,
    pub permissions: u32,
    pub mtime: u32,
    pub atime: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FileInfo {
    /// Create FileInfo for a directory
    pub fn directory() -> Self {
        Self::directory_with_mtime(current_timestamp())
    }

    pub fn directory_with_mtime(mtime: u32) -> Self {
        Self {
            size: 4096,
            is_dir: true,
            permissions: 0o040755,
            mtime,
            atime: mtime,
            uid: 1000,
            gid: 1000,
        }
    }

    /// Create FileInfo for a regular file
    pub fn file(size: u64) -> Self {
        Self::file_with_mtime(size, current_timestamp())
    }

    pub fn file_with_mtime(size: u64, mtime: u32) -> Self {
        Self {
            size,
            is_dir: false,
            permissions: 0o100644,
            mtime,
            atime: mtime,
            uid: 1000,
            gid: 1000,
        }
    }
}

/// Filesystem handle for a single tenant.
///
/// Implementations treat every path as relative to their own root. Paths
/// handed in are already normalized by [`normalize_path`]: no leading slash,
/// no `.` or `..` components, empty string for the root.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// List directory contents, including "." and ".." entries.
    async fn list_dir(&self, path: &str) -> BackendResult<Vec<DirEntry>>;

    /// Get file or directory information
    async fn file_info(&self, path: &str) -> BackendResult<FileInfo>;

    /// Create a directory. Parent directories must exist.
    async fn make_dir(&self, path: &str) -> BackendResult<()>;

    /// Delete an empty directory
    async fn del_dir(&self, path: &str) -> BackendResult<()>;

    /// Delete a file
    async fn delete(&self, path: &str) -> BackendResult<()>;

    /// Rename/move a file or directory
    async fn rename(&self, src: &str, dst: &str) -> BackendResult<()>;

    /// Read entire file contents
    async fn read_file(&self, path: &str) -> BackendResult<Bytes>;

    /// Create or overwrite the file at `path` with `content`.
    async fn write_file(&self, path: &str, content: Bytes) -> BackendResult<()>;
}

/// Normalize a peer-supplied path against a virtual root.
///
/// `.` and empty segments are dropped and `..` pops the previous segment,
/// but never above the root, so the result can not name anything outside
/// the tree it is later joined onto.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Get current Unix timestamp
pub fn current_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
