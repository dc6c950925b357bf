use crate::backend::{normalize_path, BackendError, FileInfo};
use crate::handle::{HandleManager, HandleType};
use crate::scoped::{CommandOutcome, FileCommand, ScopedHandler};
use bytes::Bytes;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Convert FileInfo to russh_sftp FileAttributes
fn to_file_attributes(info: &FileInfo) -> FileAttributes {
    FileAttributes {
        size: Some(info.size),
        permissions: Some(info.permissions),
        mtime: Some(info.mtime),
        atime: Some(info.atime),
        uid: Some(info.uid),
        gid: Some(info.gid),
        ..Default::default()
    }
}

/// Only the status code travels back to the peer, never the error text.
impl From<BackendError> for StatusCode {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound => StatusCode::NoSuchFile,
            BackendError::PermissionDenied => StatusCode::PermissionDenied,
            BackendError::NotADirectory => StatusCode::NoSuchFile,
            BackendError::AlreadyExists
            | BackendError::IsADirectory
            | BackendError::DirectoryNotEmpty
            | BackendError::Io(_)
            | BackendError::Other(_) => StatusCode::Failure,
        }
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en".to_string(),
    }
}

fn expect_done(outcome: CommandOutcome) -> Result<(), StatusCode> {
    match outcome {
        CommandOutcome::Done => Ok(()),
        CommandOutcome::Attrs(_) => Err(StatusCode::Failure),
    }
}

/// One SFTP channel served on behalf of a connection's [`ScopedHandler`].
///
/// The handler is shared by every channel of the connection; open handles
/// belong to this channel alone and are released when the protocol engine
/// drops the session, however its serve loop ended.
pub struct SftpSession {
    scoped: Arc<ScopedHandler>,
    handles: HandleManager,
    channel: String,
}

impl SftpSession {
    pub fn new(scoped: Arc<ScopedHandler>, channel: impl Into<String>) -> Self {
        Self {
            scoped,
            handles: HandleManager::new(),
            channel: channel.into(),
        }
    }

    /// Content a non-truncating open writes over. Needs read access, since
    /// the whole file is rewritten on close.
    async fn existing_content(&self, target: &str) -> Result<Vec<u8>, StatusCode> {
        match self.scoped.retrieve_file(target).await {
            Ok(content) => Ok(content.to_vec()),
            Err(BackendError::NotFound) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn stat_path(&self, id: u32, path: &str) -> Result<Attrs, StatusCode> {
        match self.scoped.command(FileCommand::Stat(path.to_string())).await? {
            CommandOutcome::Attrs(info) => Ok(Attrs {
                id,
                attrs: to_file_attributes(&info),
            }),
            CommandOutcome::Done => Err(StatusCode::Failure),
        }
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        let discarded = self.handles.release_all();
        debug!(
            channel = %self.channel,
            tenant = %self.scoped.tenant_id(),
            discarded_writes = discarded,
            "SFTP channel released"
        );
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, channel = %self.channel, "SFTP init");
        Ok(Version::new())
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        debug!(id, handle = %handle, "Closing handle");

        match self.handles.remove(&handle) {
            Some(HandleType::Write { path, buffer }) => {
                self.scoped.store_file(&path, Bytes::from(buffer)).await?;
            }
            Some(_) => {}
            None => return Err(StatusCode::Failure),
        }

        Ok(ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        debug!(id, path = %path, "Opening directory");
        let normalized = normalize_path(&path);

        // Listing up front surfaces permission and not-a-directory errors here.
        self.scoped.list_directory(&normalized).await?;

        let handle = self
            .handles
            .create_dir_handle(normalized)
            .ok_or(StatusCode::Failure)?;
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        debug!(id, handle = %handle, "Reading directory");

        match self.handles.get(&handle).ok_or(StatusCode::Failure)? {
            HandleType::Dir { read_done: true, .. } => Err(StatusCode::Eof),
            HandleType::Dir { path, .. } => {
                let entries = self.scoped.list_directory(&path).await?;
                self.handles.finish_dir(&handle);

                let files = entries
                    .into_iter()
                    .map(|entry| File {
                        filename: entry.name,
                        longname: String::new(),
                        attrs: to_file_attributes(&entry.attrs),
                    })
                    .collect();

                Ok(Name { id, files })
            }
            _ => Err(StatusCode::Failure),
        }
    }

    async fn open(
        &mut self,
        id: u32,
        path: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        debug!(id, path = %path, ?pflags, "Opening file");

        let writable = pflags.intersects(OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE);
        let handle = if writable {
            let target = self.scoped.check_store(&path)?;
            let initial = if pflags.contains(OpenFlags::TRUNCATE) {
                Vec::new()
            } else {
                self.existing_content(&target).await?
            };
            self.handles.create_write_handle(target, initial)
        } else {
            let normalized = normalize_path(&path);
            let content = self.scoped.retrieve_file(&normalized).await?;
            self.handles.create_read_handle(normalized, content)
        };

        let handle = handle.ok_or_else(|| {
            warn!(channel = %self.channel, "Open handle limit reached");
            StatusCode::Failure
        })?;
        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        debug!(id, handle = %handle, offset, len, "Reading file");

        match self.handles.get(&handle).ok_or(StatusCode::Failure)? {
            HandleType::Read { content, .. } => {
                let start = usize::try_from(offset).map_err(|_| StatusCode::Eof)?;
                if start >= content.len() {
                    return Err(StatusCode::Eof);
                }

                let end = std::cmp::min(start.saturating_add(len as usize), content.len());
                let data = content.slice(start..end).to_vec();

                Ok(Data { id, data })
            }
            _ => Err(StatusCode::Failure),
        }
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        debug!(id, handle = %handle, offset, len = data.len(), "Writing file");

        if !self.handles.write_at(&handle, offset, &data) {
            return Err(StatusCode::Failure);
        }
        Ok(ok_status(id))
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        debug!(id, path = %path, "Getting file stats");
        self.stat_path(id, &path).await
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        // No symlink support, same as stat
        self.stat_path(id, &path).await
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        match self.handles.get(&handle).ok_or(StatusCode::Failure)? {
            HandleType::Read { path, .. } => self.stat_path(id, &path).await,
            HandleType::Dir { .. } => Ok(Attrs {
                id,
                attrs: to_file_attributes(&FileInfo::directory()),
            }),
            // Not stored yet; describe what has been written so far.
            HandleType::Write { buffer, .. } => Ok(Attrs {
                id,
                attrs: to_file_attributes(&FileInfo::file(buffer.len() as u64)),
            }),
        }
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let absolute = format!("/{}", normalize_path(&path));

        Ok(Name {
            id,
            files: vec![File::dummy(&absolute)],
        })
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        debug!(id, path = %path, "Creating directory");
        expect_done(self.scoped.command(FileCommand::MakeDir(path)).await?)?;
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        debug!(id, path = %path, "Removing directory");
        expect_done(self.scoped.command(FileCommand::RemoveDir(path)).await?)?;
        Ok(ok_status(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        debug!(id, path = %filename, "Removing file");
        expect_done(self.scoped.command(FileCommand::Remove(filename)).await?)?;
        Ok(ok_status(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        debug!(id, from = %oldpath, to = %newpath, "Renaming");
        let command = FileCommand::Rename {
            from: oldpath,
            to: newpath,
        };
        expect_done(self.scoped.command(command).await?)?;
        Ok(ok_status(id))
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        expect_done(self.scoped.command(FileCommand::SetStat(path)).await?)?;
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        match self.handles.get(&handle).ok_or(StatusCode::Failure)? {
            HandleType::Write { .. } => Ok(ok_status(id)),
            HandleType::Read { path, .. } | HandleType::Dir { path, .. } => {
                expect_done(self.scoped.command(FileCommand::SetStat(path)).await?)?;
                Ok(ok_status(id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthorizationRecord, PermissionSet};
    use crate::backend::{Backend, MemoryBackend};
    use russh_sftp::server::Handler;

    fn session(perms: &[&str]) -> (SftpSession, Arc<MemoryBackend>) {
        let fs = Arc::new(MemoryBackend::new());
        let record = AuthorizationRecord::new("tenant-42", "bob", PermissionSet::from_tokens(perms));
        let scoped = Arc::new(ScopedHandler::new(&record, fs.clone(), false));
        (SftpSession::new(scoped, "test"), fs)
    }

    #[tokio::test]
    async fn test_upload_is_stored_on_close() {
        let (mut sftp, fs) = session(&["*"]);

        let handle = sftp
            .open(
                1,
                "/upload.txt".into(),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;
        sftp.write(2, handle.clone(), 0, b"hello ".to_vec()).await.unwrap();
        sftp.write(3, handle.clone(), 6, b"world".to_vec()).await.unwrap();
        assert!(fs.read_file("upload.txt").await.is_err());

        sftp.close(4, handle).await.unwrap();
        assert_eq!(
            fs.read_file("upload.txt").await.unwrap().as_ref(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_read_only_session_refuses_open_for_write() {
        let (mut sftp, _) = session(&["list", "read"]);

        let result = sftp
            .open(
                1,
                "upload.txt".into(),
                OpenFlags::WRITE | OpenFlags::CREATE,
                FileAttributes::default(),
            )
            .await;
        assert!(matches!(result, Err(StatusCode::PermissionDenied)));

        let mkdir = sftp.mkdir(2, "d".into(), FileAttributes::default()).await;
        assert!(matches!(mkdir, Err(StatusCode::PermissionDenied)));

        let dir = sftp.opendir(3, "/".into()).await.unwrap().handle;
        let listing = sftp.readdir(4, dir.clone()).await.unwrap();
        assert!(listing.files.iter().any(|f| f.filename == "."));
        assert!(matches!(sftp.readdir(5, dir).await, Err(StatusCode::Eof)));
    }

    #[tokio::test]
    async fn test_download_in_chunks() {
        let (mut sftp, fs) = session(&["list", "read"]);
        fs.write_file("data.bin", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let handle = sftp
            .open(1, "data.bin".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap()
            .handle;
        let first = sftp.read(2, handle.clone(), 0, 4).await.unwrap();
        assert_eq!(first.data, b"0123");
        let last = sftp.read(3, handle.clone(), 8, 4).await.unwrap();
        assert_eq!(last.data, b"89");
        assert!(matches!(
            sftp.read(4, handle.clone(), 10, 4).await,
            Err(StatusCode::Eof)
        ));

        let attrs = sftp.fstat(5, handle).await.unwrap();
        assert_eq!(attrs.attrs.size, Some(10));
    }

    #[tokio::test]
    async fn test_realpath_is_clamped_to_root() {
        let (mut sftp, _) = session(&["list"]);
        let name = sftp.realpath(1, "../../etc".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/etc");
        let root = sftp.realpath(2, ".".into()).await.unwrap();
        assert_eq!(root.files[0].filename, "/");
    }

    #[tokio::test]
    async fn test_unknown_handle_fails() {
        let (mut sftp, _) = session(&["*"]);
        assert!(matches!(
            sftp.close(1, "nope".into()).await,
            Err(StatusCode::Failure)
        ));
        assert!(matches!(
            sftp.write(2, "nope".into(), 0, vec![1]).await,
            Err(StatusCode::Failure)
        ));
    }

    #[tokio::test]
    async fn test_resumed_upload_keeps_existing_bytes() {
        let (mut sftp, fs) = session(&["*"]);
        fs.write_file("big.bin", Bytes::from_static(b"first half|"))
            .await
            .unwrap();

        let handle = sftp
            .open(1, "big.bin".into(), OpenFlags::WRITE, FileAttributes::default())
            .await
            .unwrap()
            .handle;
        sftp.write(2, handle.clone(), 11, b"second half".to_vec())
            .await
            .unwrap();
        sftp.write(3, handle.clone(), 0, b"FIRST".to_vec()).await.unwrap();
        sftp.close(4, handle).await.unwrap();

        assert_eq!(
            fs.read_file("big.bin").await.unwrap().as_ref(),
            b"FIRST half|second half"
        );
    }

    #[tokio::test]
    async fn test_truncating_open_discards_existing_bytes() {
        let (mut sftp, fs) = session(&["*"]);
        fs.write_file("f.txt", Bytes::from_static(b"old content"))
            .await
            .unwrap();

        let handle = sftp
            .open(
                1,
                "f.txt".into(),
                OpenFlags::WRITE | OpenFlags::TRUNCATE,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;
        sftp.write(2, handle.clone(), 0, b"new".to_vec()).await.unwrap();
        sftp.close(3, handle).await.unwrap();
        assert_eq!(fs.read_file("f.txt").await.unwrap().as_ref(), b"new");
    }

    #[tokio::test]
    async fn test_write_only_login_must_truncate() {
        let (mut sftp, fs) = session(&["write"]);
        fs.write_file("f.txt", Bytes::from_static(b"old content"))
            .await
            .unwrap();

        let append = sftp
            .open(
                1,
                "f.txt".into(),
                OpenFlags::WRITE | OpenFlags::APPEND,
                FileAttributes::default(),
            )
            .await;
        assert!(matches!(append, Err(StatusCode::PermissionDenied)));

        let truncate = sftp
            .open(
                2,
                "f.txt".into(),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                FileAttributes::default(),
            )
            .await;
        assert!(truncate.is_ok());
    }

    #[tokio::test]
    async fn test_open_handle_limit_is_a_failure_status() {
        let (mut sftp, fs) = session(&["*"]);
        fs.write_file("f.txt", Bytes::from_static(b"x")).await.unwrap();

        for id in 0..crate::handle::MAX_OPEN_HANDLES as u32 {
            sftp.open(id, "f.txt".into(), OpenFlags::READ, FileAttributes::default())
                .await
                .unwrap();
        }
        assert!(matches!(
            sftp.open(999, "f.txt".into(), OpenFlags::READ, FileAttributes::default())
                .await,
            Err(StatusCode::Failure)
        ));
    }
}
