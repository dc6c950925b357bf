use super::{normalize_path, Backend, BackendError, BackendResult, DirEntry, FileInfo};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Tenant filesystem rooted at a directory on local disk
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new local backend rooted at the given path
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Map a path into the root, refusing anything that resolves (through
    /// symlinks) outside of it. Targets that do not exist yet are checked
    /// through their parent directory, and must not be a dangling symlink.
    async fn full_path(&self, path: &str) -> BackendResult<PathBuf> {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            return Ok(self.root.clone());
        }

        let full = self.root.join(&normalized);
        let root = fs::canonicalize(&self.root)
            .await
            .map_err(Self::map_io_error)?;

        let resolved = match fs::canonicalize(&full).await {
            Ok(resolved) => resolved,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if fs::symlink_metadata(&full).await.is_ok() {
                    warn!(path = %normalized, "Refusing dangling symlink");
                    return Err(BackendError::PermissionDenied);
                }
                let parent = full.parent().unwrap_or(&self.root);
                fs::canonicalize(parent).await.map_err(Self::map_io_error)?
            }
            Err(err) => return Err(Self::map_io_error(err)),
        };

        if resolved.starts_with(&root) {
            Ok(full)
        } else {
            warn!(path = %normalized, resolved = %resolved.display(), "Path escapes tenant root");
            Err(BackendError::PermissionDenied)
        }
    }

    /// Convert std::io::Error to BackendError
    fn map_io_error(err: std::io::Error) -> BackendError {
        #[cfg(unix)]
        if err.raw_os_error() == Some(libc::ELOOP) {
            return BackendError::PermissionDenied;
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => BackendError::NotFound,
            std::io::ErrorKind::PermissionDenied => BackendError::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => BackendError::AlreadyExists,
            std::io::ErrorKind::DirectoryNotEmpty => BackendError::DirectoryNotEmpty,
            std::io::ErrorKind::IsADirectory => BackendError::IsADirectory,
            _ => BackendError::Io(err.to_string()),
        }
    }

    /// Convert filesystem metadata to FileInfo
    fn metadata_to_info(metadata: &std::fs::Metadata) -> FileInfo {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let atime = metadata
            .accessed()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(mtime);

        #[cfg(unix)]
        let (permissions, uid, gid) = {
            use std::os::unix::fs::MetadataExt;
            (metadata.mode(), metadata.uid(), metadata.gid())
        };

        #[cfg(not(unix))]
        let (permissions, uid, gid) = {
            if metadata.is_dir() {
                (0o755, 1000, 1000)
            } else {
                (0o644, 1000, 1000)
            }
        };

        FileInfo {
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            permissions,
            mtime,
            atime,
            uid,
            gid,
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn list_dir(&self, path: &str) -> BackendResult<Vec<DirEntry>> {
        let full_path = self.full_path(path).await?;

        debug!(path = %full_path.display(), "Listing directory");

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

        let mut read_dir = fs::read_dir(&full_path).await.map_err(Self::map_io_error)?;

        while let Some(entry) = read_dir.next_entry().await.map_err(Self::map_io_error)? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry.metadata().await.map_err(Self::map_io_error)?;
            let attrs = Self::metadata_to_info(&metadata);

            entries.push(DirEntry { name, attrs });
        }

        Ok(entries)
    }

    async fn file_info(&self, path: &str) -> BackendResult<FileInfo> {
        let full_path = self.full_path(path).await?;

        debug!(path = %full_path.display(), "Getting file info");

        let metadata = fs::metadata(&full_path).await.map_err(Self::map_io_error)?;
        Ok(Self::metadata_to_info(&metadata))
    }

    async fn make_dir(&self, path: &str) -> BackendResult<()> {
        let full_path = self.full_path(path).await?;

        debug!(path = %full_path.display(), "Creating directory");

        fs::create_dir(&full_path).await.map_err(Self::map_io_error)
    }

    async fn del_dir(&self, path: &str) -> BackendResult<()> {
        let full_path = self.full_path(path).await?;

        debug!(path = %full_path.display(), "Removing directory");

        fs::remove_dir(&full_path).await.map_err(Self::map_io_error)
    }

    async fn delete(&self, path: &str) -> BackendResult<()> {
        let full_path = self.full_path(path).await?;

        debug!(path = %full_path.display(), "Deleting file");

        fs::remove_file(&full_path)
            .await
            .map_err(Self::map_io_error)
    }

    async fn rename(&self, src: &str, dst: &str) -> BackendResult<()> {
        let src_path = self.full_path(src).await?;
        let dst_path = self.full_path(dst).await?;

        debug!(from = %src_path.display(), to = %dst_path.display(), "Renaming");

        fs::rename(&src_path, &dst_path)
            .await
            .map_err(Self::map_io_error)
    }

    async fn read_file(&self, path: &str) -> BackendResult<Bytes> {
        let full_path = self.full_path(path).await?;

        debug!(path = %full_path.display(), "Reading file");

        let content = fs::read(&full_path).await.map_err(Self::map_io_error)?;
        Ok(Bytes::from(content))
    }

    async fn write_file(&self, path: &str, content: Bytes) -> BackendResult<()> {
        let full_path = self.full_path(path).await?;

        debug!(path = %full_path.display(), len = content.len(), "Writing file");

        // The final component is never followed, even if it turned into a
        // symlink after the check above.
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.custom_flags(libc::O_NOFOLLOW);

        let mut file = options.open(&full_path).await.map_err(Self::map_io_error)?;
        file.write_all(&content).await.map_err(Self::map_io_error)?;
        file.flush().await.map_err(Self::map_io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read_file() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path());

        let content = Bytes::from_static(b"hello world");
        backend
            .write_file("test.txt", content.clone())
            .await
            .unwrap();
        let read = backend.read_file("test.txt").await.unwrap();
        assert_eq!(read, content);
    }

    #[tokio::test]
    async fn test_make_and_list_dir() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path());

        backend.make_dir("subdir").await.unwrap();
        backend
            .write_file("file1.txt", Bytes::from_static(b"a"))
            .await
            .unwrap();

        let entries = backend.list_dir("/").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();

        assert!(names.contains(&".."));
        assert!(names.contains(&"subdir"));
        assert!(names.contains(&"file1.txt"));

        let info = backend.file_info("subdir").await.unwrap();
        assert!(info.is_dir);
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp_dir.path());

        backend
            .write_file("old.txt", Bytes::from_static(b"data"))
            .await
            .unwrap();
        backend.rename("old.txt", "new.txt").await.unwrap();
        assert!(matches!(
            backend.read_file("old.txt").await,
            Err(BackendError::NotFound)
        ));

        backend.delete("new.txt").await.unwrap();
        assert!(matches!(
            backend.read_file("new.txt").await,
            Err(BackendError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_parent_segments_stay_inside_root() {
        let outer = TempDir::new().unwrap();
        std::fs::write(outer.path().join("secret.txt"), b"outside").unwrap();
        let root = outer.path().join("tenant");
        std::fs::create_dir(&root).unwrap();

        let backend = LocalBackend::new(&root);
        assert!(matches!(
            backend.read_file("../secret.txt").await,
            Err(BackendError::NotFound)
        ));

        backend
            .write_file("../../escape.txt", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(root.join("escape.txt").exists());
        assert!(!outer.path().join("escape.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_root_is_refused() {
        let outer = TempDir::new().unwrap();
        let elsewhere = outer.path().join("elsewhere");
        std::fs::create_dir(&elsewhere).unwrap();
        std::fs::write(elsewhere.join("loot.txt"), b"outside").unwrap();
        let root = outer.path().join("tenant");
        std::fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink(&elsewhere, root.join("link")).unwrap();

        let backend = LocalBackend::new(&root);
        assert!(matches!(
            backend.read_file("link/loot.txt").await,
            Err(BackendError::PermissionDenied)
        ));
        assert!(matches!(
            backend
                .write_file("link/new.txt", Bytes::from_static(b"x"))
                .await,
            Err(BackendError::PermissionDenied)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dangling_symlink_is_not_written_through() {
        let base = TempDir::new().unwrap();
        let tenant_a = base.path().join("tenant-a");
        let tenant_b = base.path().join("tenant-b");
        std::fs::create_dir(&tenant_a).unwrap();
        std::fs::create_dir(&tenant_b).unwrap();
        std::os::unix::fs::symlink("../tenant-b/planted.txt", tenant_a.join("innocent.txt"))
            .unwrap();

        let backend = LocalBackend::new(&tenant_a);
        assert!(matches!(
            backend
                .write_file("innocent.txt", Bytes::from_static(b"pwned"))
                .await,
            Err(BackendError::PermissionDenied)
        ));
        assert!(!tenant_b.join("planted.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_does_not_follow_final_symlink() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("real.txt"), b"original").unwrap();
        std::os::unix::fs::symlink("real.txt", temp_dir.path().join("alias.txt")).unwrap();

        let backend = LocalBackend::new(temp_dir.path());
        assert!(matches!(
            backend
                .write_file("alias.txt", Bytes::from_static(b"changed"))
                .await,
            Err(BackendError::PermissionDenied)
        ));
        assert_eq!(
            std::fs::read(temp_dir.path().join("real.txt")).unwrap(),
            b"original"
        );
    }
}
