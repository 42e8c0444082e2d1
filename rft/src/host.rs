//! Operations executed on the local host.
//!
//! `rftd` runs every command of a connection against one [`LocalHost`], and
//! a client [`Session`](crate::client::Session) opened on `localhost` calls
//! the same methods directly, so both paths share their errno behaviour.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;

use remote::protocol::Verb;
use remote::protocol::command::{CreateAttr, LockType, VolumeRequest, Whence};
use remote::protocol::reply::{DirEntry, FsCapacity, StatInfo, VolInfo};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

use crate::archive::{self, ArchiveControl, XattrArchive};
use crate::fsinfo;
use crate::handles::HandleTable;
use crate::volume::MediaLibrary;

/// Failure of a local operation.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    /// The operation failed; its errno is echoed to the caller.
    #[error(transparent)]
    Os(#[from] std::io::Error),
    /// The session itself can no longer continue.
    #[error(transparent)]
    Session(#[from] remote::Error),
}

pub type OpResult<T> = std::result::Result<T, OpError>;

impl OpError {
    pub fn errno(&self) -> i32 {
        match self {
            OpError::Os(e) => remote::errno_of(e),
            OpError::Session(e) => e.errno(),
        }
    }

    /// Express the failure the way a remote reply would have.
    pub fn into_remote(self, verb: Verb) -> remote::Error {
        match self {
            OpError::Os(e) => remote::Error::Remote {
                verb,
                rc: -1,
                errno: remote::errno_of(&e),
            },
            OpError::Session(e) => e,
        }
    }
}

fn errno(code: i32) -> OpError {
    OpError::Os(std::io::Error::from_raw_os_error(code))
}

fn join_error(e: tokio::task::JoinError) -> OpError {
    OpError::Os(std::io::Error::other(e))
}

/// Collaborators of the local operations.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Removable media library; volume operations fail with `ENODEV` without one.
    pub media: Option<std::sync::Arc<dyn MediaLibrary>>,
    pub archive: std::sync::Arc<dyn ArchiveControl>,
    /// Equipment ordinal reported for loaded volumes.
    pub eq: i32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            media: None,
            archive: std::sync::Arc::new(XattrArchive),
            eq: 0,
        }
    }
}

#[derive(Debug)]
struct MountedVolume {
    file: tokio::fs::File,
    request: VolumeRequest,
    block_size: u64,
    request_file: std::path::PathBuf,
}

/// What `OPEN` or `LOADVOL` left open for the session.
#[derive(Debug)]
enum OpenHandle {
    File {
        file: tokio::fs::File,
        path: std::path::PathBuf,
    },
    Volume(MountedVolume),
}

fn open_options(oflag: i32, mode: Option<u32>) -> tokio::fs::OpenOptions {
    let mut options = tokio::fs::OpenOptions::new();
    match oflag & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    let create = oflag & libc::O_CREAT != 0;
    options
        .append(oflag & libc::O_APPEND != 0)
        .truncate(oflag & libc::O_TRUNC != 0)
        .create(create)
        .create_new(create && oflag & libc::O_EXCL != 0)
        .custom_flags(
            oflag & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND | libc::O_EXCL),
        );
    if let Some(mode) = mode {
        options.mode(mode);
    }
    options
}

/// Apply the mode, then try to hand the path to `uid:gid`. Ownership changes
/// routinely fail for unprivileged servers and are not errors.
async fn apply_attr(path: &str, attr: CreateAttr) -> std::io::Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(attr.mode)).await?;
    let owned = path.to_string();
    let chown = tokio::task::spawn_blocking(move || {
        nix::unistd::chown(
            owned.as_str(),
            Some(nix::unistd::Uid::from_raw(attr.uid)),
            Some(nix::unistd::Gid::from_raw(attr.gid)),
        )
    })
    .await;
    match chown {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Ignoring chown({}, {}) of {path}: {e}", attr.uid, attr.gid),
        Err(e) => tracing::debug!("Ignoring chown of {path}: {e}"),
    }
    Ok(())
}

fn set_lock(file: &std::fs::File, lock: LockType) -> std::io::Result<()> {
    let operation = match lock {
        LockType::Read => libc::LOCK_SH,
        LockType::Write => libc::LOCK_EX,
        LockType::Unlock => libc::LOCK_UN,
    };
    // SAFETY: the descriptor stays open for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Per-session state of local operations: at most one open file or volume,
/// plus any number of open directories.
#[derive(Debug)]
pub struct LocalHost {
    config: HostConfig,
    handle: Option<OpenHandle>,
    dirs: HandleTable<tokio::fs::ReadDir>,
    store_error: Option<i32>,
}

impl LocalHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            handle: None,
            dirs: HandleTable::default(),
            store_error: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn file_mut(&mut self) -> OpResult<&mut tokio::fs::File> {
        match &mut self.handle {
            Some(OpenHandle::File { file, .. }) => Ok(file),
            Some(OpenHandle::Volume(volume)) => Ok(&mut volume.file),
            None => Err(errno(libc::EBADF)),
        }
    }

    fn volume_mut(&mut self) -> OpResult<&mut MountedVolume> {
        match &mut self.handle {
            Some(OpenHandle::Volume(volume)) => Ok(volume),
            Some(OpenHandle::File { .. }) => Err(errno(libc::ENOTTY)),
            None => Err(errno(libc::EBADF)),
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn open(&mut self, path: &str, oflag: i32, create: Option<CreateAttr>) -> OpResult<()> {
        if let Some(previous) = self.handle.take() {
            tracing::debug!("Replacing handle still open for the session");
            self.release_handle(previous).await;
        }
        self.store_error = None;
        let truncating = oflag & (libc::O_CREAT | libc::O_TRUNC) == (libc::O_CREAT | libc::O_TRUNC);
        if create.is_some() && truncating {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!("Removed existing {path} before re-creating it"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let file = open_options(oflag, create.map(|attr| attr.mode))
            .open(path)
            .await?;
        if let Some(attr) = create {
            apply_attr(path, attr).await?;
        }
        self.handle = Some(OpenHandle::File {
            file,
            path: path.into(),
        });
        Ok(())
    }

    /// Write all of `data` at the current offset.
    pub async fn write(&mut self, data: &[u8]) -> OpResult<usize> {
        let file = self.file_mut()?;
        file.write_all(data).await?;
        // surfaces errors of the background write
        file.flush().await?;
        Ok(data.len())
    }

    /// Read up to `len` bytes; fewer only at end of file.
    pub async fn read(&mut self, len: usize) -> OpResult<Vec<u8>> {
        let file = self.file_mut()?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|e| {
            remote::Error::Allocation(format!("read buffer of {len} bytes: {e}"))
        })?;
        (&mut *file).take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub async fn seek(&mut self, offset: i64, whence: Whence) -> OpResult<u64> {
        let pos = match whence {
            Whence::Set => {
                std::io::SeekFrom::Start(u64::try_from(offset).map_err(|_| errno(libc::EINVAL))?)
            }
            Whence::Current => std::io::SeekFrom::Current(offset),
            Whence::End => std::io::SeekFrom::End(offset),
        };
        Ok(self.file_mut()?.seek(pos).await?)
    }

    /// Advisory whole-file lock. Unlocking first syncs the file to disk.
    #[instrument(level = "debug", skip(self))]
    pub async fn flock(&mut self, lock: LockType) -> OpResult<()> {
        let file = self.file_mut()?;
        if lock == LockType::Unlock {
            file.sync_all().await?;
        }
        // the duplicate shares the lock with the session's descriptor
        let duplicate = file.try_clone().await?.into_std().await;
        tokio::task::spawn_blocking(move || set_lock(&duplicate, lock))
            .await
            .map_err(join_error)??;
        Ok(())
    }

    /// Close the open file or volume. A failure of an earlier `STOR` into
    /// the file is reported here.
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&mut self) -> OpResult<()> {
        let handle = self.handle.take().ok_or_else(|| errno(libc::EBADF))?;
        let store_error = self.store_error.take();
        let closed = match handle {
            OpenHandle::File { mut file, path } => {
                tracing::debug!("Closing {path:?}");
                file.flush().await.map_err(OpError::from)
            }
            OpenHandle::Volume(volume) => self.unload(volume, 0).await.map(|_| ()),
        };
        if let Some(code) = store_error {
            return Err(errno(code));
        }
        closed
    }

    /// Remember the first failure of a `STOR` stream for the next `close`.
    pub fn record_store_error(&mut self, code: i32) {
        self.store_error.get_or_insert(code);
    }

    pub fn store_failed(&self) -> bool {
        self.store_error.is_some()
    }

    pub async fn unlink(&mut self, path: &str) -> OpResult<()> {
        Ok(tokio::fs::remove_file(path).await?)
    }

    pub async fn mkdir(&mut self, path: &str, attr: CreateAttr) -> OpResult<()> {
        tokio::fs::DirBuilder::new()
            .mode(attr.mode)
            .create(path)
            .await?;
        apply_attr(path, attr).await?;
        Ok(())
    }

    pub async fn rmdir(&mut self, path: &str) -> OpResult<()> {
        Ok(tokio::fs::remove_dir(path).await?)
    }

    pub async fn opendir(&mut self, path: &str) -> OpResult<usize> {
        let entries = tokio::fs::read_dir(path).await?;
        let dir = self.dirs.insert(entries)?;
        tracing::debug!("Opened directory {path} as {dir}");
        Ok(dir)
    }

    /// Next entry of an open directory, `None` at its end. `.` and `..` are
    /// never returned, nor are names that cannot travel on the control line.
    pub async fn readdir(&mut self, dir: usize) -> OpResult<Option<DirEntry>> {
        let entries = self.dirs.get_mut(dir).ok_or_else(|| errno(libc::EBADF))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str().filter(|name| remote::protocol::is_representable(name))
            else {
                tracing::warn!("Skipping directory entry {:?}", entry.file_name());
                continue;
            };
            let is_dir = entry.file_type().await?.is_dir();
            return Ok(Some(DirEntry {
                name: name.to_string(),
                is_dir,
            }));
        }
        Ok(None)
    }

    /// Close a directory handle. Closing always succeeds; an unknown handle
    /// is only logged.
    pub fn closedir(&mut self, dir: usize) {
        if self.dirs.remove(dir).is_none() {
            tracing::debug!("Ignoring close of unknown directory handle {dir}");
        }
    }

    pub async fn stat(&mut self, path: &str) -> OpResult<StatInfo> {
        Ok(fsinfo::stat(path).await?)
    }

    pub async fn statvfs(&mut self, mount_point: &str, offline: bool) -> OpResult<FsCapacity> {
        Ok(fsinfo::statvfs(mount_point, offline).await?)
    }

    pub async fn space_used(&mut self, path: &str) -> OpResult<u64> {
        Ok(fsinfo::space_used(path).await?)
    }

    pub async fn is_mounted(&mut self, mount_point: &str) -> bool {
        fsinfo::is_mounted(mount_point).await
    }

    pub async fn archive_op(&mut self, path: &str, ops: &str) -> OpResult<()> {
        Ok(archive::archive_op(self.config.archive.clone(), path, ops).await?)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn load_vol(&mut self, request: &VolumeRequest, oflag: i32) -> OpResult<()> {
        let media = self.config.media.clone().ok_or_else(|| errno(libc::ENODEV))?;
        if self.handle.is_some() {
            return Err(errno(libc::EBUSY));
        }
        let loaded = {
            let request = request.clone();
            tokio::task::spawn_blocking(move || media.load(&request, oflag))
                .await
                .map_err(join_error)??
        };
        self.handle = Some(OpenHandle::Volume(MountedVolume {
            file: tokio::fs::File::from_std(loaded.file),
            request: request.clone(),
            block_size: loaded.block_size,
            request_file: loaded.request_file,
        }));
        Ok(())
    }

    pub async fn get_vol_info(&mut self) -> OpResult<VolInfo> {
        let eq = self.config.eq;
        let volume = self.volume_mut()?;
        let offset = volume.file.stream_position().await?;
        Ok(VolInfo {
            block_size: volume.block_size,
            position: offset / volume.block_size,
            eq,
        })
    }

    pub async fn seek_vol(&mut self, block: u64) -> OpResult<()> {
        let volume = self.volume_mut()?;
        let offset = block
            .checked_mul(volume.block_size)
            .ok_or_else(|| errno(libc::EINVAL))?;
        volume.file.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(())
    }

    /// Unload the mounted volume, returning the block position it was left at.
    pub async fn unload_vol(&mut self, flags: i32) -> OpResult<u64> {
        self.volume_mut()?;
        match self.handle.take() {
            Some(OpenHandle::Volume(volume)) => self.unload(volume, flags).await,
            _ => Err(errno(libc::EBADF)),
        }
    }

    async fn unload(&self, mut volume: MountedVolume, flags: i32) -> OpResult<u64> {
        let position = volume.file.stream_position().await? / volume.block_size;
        volume.file.flush().await?;
        drop(volume.file);
        if let Some(media) = self.config.media.clone() {
            let request_file = volume.request_file.clone();
            tokio::task::spawn_blocking(move || media.unload(&request_file))
                .await
                .map_err(join_error)??;
        }
        tracing::info!(
            "Unloaded volume {}.{} at block {position} (flags {flags:#x})",
            volume.request.media,
            volume.request.vsn
        );
        Ok(position)
    }

    async fn release_handle(&self, handle: OpenHandle) {
        match handle {
            OpenHandle::File { mut file, path } => {
                if let Err(e) = file.flush().await {
                    tracing::warn!("Failed to flush {path:?}: {e}");
                }
            }
            OpenHandle::Volume(volume) => {
                if let Err(e) = self.unload(volume, 0).await {
                    tracing::warn!("Failed to unload volume: {e}");
                }
            }
        }
    }

    /// Close everything the session still holds.
    pub async fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.release_handle(handle).await;
        }
        let dirs = self.dirs.drain();
        if !dirs.is_empty() {
            tracing::debug!("Closed {} directories left open", dirs.len());
        }
        self.store_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::DirectoryLibrary;

    fn path_str(path: &std::path::Path) -> &str {
        path.to_str().unwrap()
    }

    fn attr(mode: u32) -> CreateAttr {
        CreateAttr {
            mode,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    #[tokio::test]
    async fn create_write_seek_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        let mut host = LocalHost::new(HostConfig::default());
        host.open(
            path_str(&path),
            libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
            Some(attr(0o640)),
        )
        .await
        .unwrap();
        assert_eq!(host.write(b"hello world").await.unwrap(), 11);
        assert_eq!(host.seek(6, Whence::Set).await.unwrap(), 6);
        assert_eq!(host.read(100).await.unwrap(), b"world");
        assert_eq!(host.seek(-5, Whence::End).await.unwrap(), 6);
        assert_eq!(host.read(2).await.unwrap(), b"wo");
        assert_eq!(host.seek(1, Whence::Current).await.unwrap(), 9);
        assert_eq!(host.seek(-1, Whence::Set).await.unwrap_err().errno(), libc::EINVAL);
        host.close().await.unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o640);
        assert_eq!(host.close().await.unwrap_err().errno(), libc::EBADF);
        assert_eq!(host.write(b"x").await.unwrap_err().errno(), libc::EBADF);
    }

    #[tokio::test]
    async fn truncating_create_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"old contents").unwrap();
        let hard_link = dir.path().join("link");
        std::fs::hard_link(&path, &hard_link).unwrap();
        let mut host = LocalHost::new(HostConfig::default());
        host.open(
            path_str(&path),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            Some(attr(0o600)),
        )
        .await
        .unwrap();
        host.write(b"new").await.unwrap();
        host.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        // unlinked, not truncated in place
        assert_eq!(std::fs::read(&hard_link).unwrap(), b"old contents");
    }

    #[tokio::test]
    async fn open_errors_are_errnos() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = LocalHost::new(HostConfig::default());
        let missing = dir.path().join("missing");
        let err = host
            .open(path_str(&missing), libc::O_RDONLY, None)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(!host.is_open());
        let remote = err.into_remote(Verb::Open);
        assert_eq!(remote.errno(), libc::ENOENT);
        assert!(!remote.is_fatal());
    }

    #[tokio::test]
    async fn store_error_is_reported_by_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        let mut host = LocalHost::new(HostConfig::default());
        host.open(path_str(&path), libc::O_WRONLY | libc::O_CREAT, None)
            .await
            .unwrap();
        host.record_store_error(libc::ENOSPC);
        host.record_store_error(libc::EIO);
        assert!(host.store_failed());
        assert_eq!(host.close().await.unwrap_err().errno(), libc::ENOSPC);
        assert!(!host.store_failed());
    }

    #[tokio::test]
    async fn locks_are_exclusive_between_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        std::fs::write(&path, b"x").unwrap();
        let mut first = LocalHost::new(HostConfig::default());
        first.open(path_str(&path), libc::O_RDWR, None).await.unwrap();
        first.flock(LockType::Write).await.unwrap();
        let mut second = LocalHost::new(HostConfig::default());
        second.open(path_str(&path), libc::O_RDWR, None).await.unwrap();
        let mut waiting = Box::pin(second.flock(LockType::Read));
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(100), &mut waiting).await;
        assert!(blocked.is_err(), "read lock granted while write lock held");
        first.flock(LockType::Unlock).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        let mut closed = LocalHost::new(HostConfig::default());
        let err = closed.flock(LockType::Read).await.unwrap_err();
        assert_eq!(err.errno(), libc::EBADF);
    }

    #[tokio::test]
    async fn directories_enumerate_and_table_reuses_slots() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        let mut host = LocalHost::new(HostConfig::default());
        host.mkdir(path_str(&root), attr(0o750)).await.unwrap();
        assert_eq!(
            std::fs::metadata(&root).unwrap().permissions().mode() & 0o777,
            0o750
        );
        std::fs::write(root.join("a"), b"").unwrap();
        std::fs::create_dir(root.join("b")).unwrap();
        std::fs::write(root.join("bad name"), b"").unwrap();
        let handle = host.opendir(path_str(&root)).await.unwrap();
        let mut seen = Vec::new();
        while let Some(entry) = host.readdir(handle).await.unwrap() {
            seen.push((entry.name, entry.is_dir));
        }
        seen.sort();
        assert_eq!(seen, vec![("a".to_string(), false), ("b".to_string(), true)]);
        host.closedir(handle);
        assert_eq!(host.readdir(handle).await.unwrap_err().errno(), libc::EBADF);
        // closing twice is harmless
        host.closedir(handle);
        assert_eq!(host.opendir(path_str(&root)).await.unwrap(), handle);
        let err = host.rmdir(path_str(&root)).await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOTEMPTY);
        host.unlink(path_str(&root.join("a"))).await.unwrap();
        host.release().await;
    }

    #[tokio::test]
    async fn volume_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("lt")).unwrap();
        std::fs::write(dir.path().join("lt/VOL001"), vec![0u8; 64 * 1024]).unwrap();
        let library = DirectoryLibrary::new(dir.path()).with_block_size(1024);
        let mut host = LocalHost::new(HostConfig {
            media: Some(std::sync::Arc::new(library)),
            eq: 42,
            ..Default::default()
        });
        let request = VolumeRequest::new("lt", "VOL001");
        host.load_vol(&request, libc::O_RDWR).await.unwrap();
        assert_eq!(
            host.load_vol(&request, libc::O_RDWR).await.unwrap_err().errno(),
            libc::EBUSY
        );
        host.seek_vol(3).await.unwrap();
        host.write(&[1u8; 1536]).await.unwrap();
        let info = host.get_vol_info().await.unwrap();
        assert_eq!(
            info,
            VolInfo {
                block_size: 1024,
                position: 4,
                eq: 42
            }
        );
        let request_file = dir.path().join(".requests/lt.VOL001");
        assert!(request_file.exists());
        assert_eq!(host.unload_vol(0).await.unwrap(), 4);
        assert!(!request_file.exists());
        assert!(!host.is_open());
        assert_eq!(host.get_vol_info().await.unwrap_err().errno(), libc::EBADF);
    }

    #[tokio::test]
    async fn volume_errors() {
        let mut host = LocalHost::new(HostConfig::default());
        let request = VolumeRequest::new("lt", "VOL001");
        assert_eq!(
            host.load_vol(&request, libc::O_RDONLY).await.unwrap_err().errno(),
            libc::ENODEV
        );
        let dir = tempfile::tempdir().unwrap();
        let mut host = LocalHost::new(HostConfig {
            media: Some(std::sync::Arc::new(DirectoryLibrary::new(dir.path()))),
            ..Default::default()
        });
        let bad = VolumeRequest::new("lt", "TOOLONGVSN");
        assert_eq!(
            host.load_vol(&bad, libc::O_RDONLY).await.unwrap_err().errno(),
            libc::EINVAL
        );
        assert!(!host.is_open());
        let file = dir.path().join("plain");
        host.open(path_str(&file), libc::O_RDWR | libc::O_CREAT, None)
            .await
            .unwrap();
        assert_eq!(host.get_vol_info().await.unwrap_err().errno(), libc::ENOTTY);
        assert_eq!(host.unload_vol(0).await.unwrap_err().errno(), libc::ENOTTY);
        assert!(host.is_open());
    }
}
