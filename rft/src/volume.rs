//! Removable media.
//!
//! `LOADVOL` hands a [`VolumeRequest`] to a [`MediaLibrary`], which mounts
//! the volume and returns an open handle on it. Positions on a loaded volume
//! are counted in blocks of the volume's block size.

use remote::protocol::command::VolumeRequest;

/// Block size used when a library does not report one.
pub const DEFAULT_BLOCK_SIZE: u64 = 16 * 1024;

/// Longest volume serial name.
pub const MAX_VSN_LEN: usize = 6;

/// A volume mounted on behalf of one session.
#[derive(Debug)]
pub struct LoadedVolume {
    pub file: std::fs::File,
    pub block_size: u64,
    /// Transient request file, unlinked when the volume is unloaded.
    pub request_file: std::path::PathBuf,
}

/// Source of removable media volumes.
///
/// Implementations block; callers run them on the blocking pool.
pub trait MediaLibrary: std::fmt::Debug + Send + Sync {
    fn load(&self, request: &VolumeRequest, oflag: i32) -> std::io::Result<LoadedVolume>;

    /// Release a volume loaded by [`MediaLibrary::load`].
    fn unload(&self, request_file: &std::path::Path) -> std::io::Result<()> {
        match std::fs::remove_file(request_file) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Volume serial names are 1 to 6 characters of upper case letters, digits
/// and the punctuation allowed on tape labels.
pub fn is_valid_vsn(vsn: &str) -> bool {
    const PUNCTUATION: &str = "!\"%&'()*+,-./:;<=>?_";
    !vsn.is_empty()
        && vsn.len() <= MAX_VSN_LEN
        && vsn
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || PUNCTUATION.contains(c))
}

fn is_valid_media(media: &str) -> bool {
    !media.is_empty()
        && media.len() <= 4
        && media
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn errno(code: i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(code)
}

/// Library whose volumes are files under `<root>/<media>/<vsn>`.
///
/// Requests are recorded as `<root>/.requests/<media>.<vsn>`; the file
/// exists while the volume is loaded and keeps a second session from
/// loading the same volume.
#[derive(Debug, Clone)]
pub struct DirectoryLibrary {
    root: std::path::PathBuf,
    block_size: u64,
}

impl DirectoryLibrary {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            root: root.into(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn requests_dir(&self) -> std::path::PathBuf {
        self.root.join(".requests")
    }
}

impl MediaLibrary for DirectoryLibrary {
    fn load(&self, request: &VolumeRequest, oflag: i32) -> std::io::Result<LoadedVolume> {
        use std::io::Write;
        if !is_valid_vsn(&request.vsn) || !is_valid_media(&request.media) {
            tracing::warn!("Rejecting volume request {}.{}", request.media, request.vsn);
            return Err(errno(libc::EINVAL));
        }
        let volume_path = self.root.join(&request.media).join(&request.vsn);
        if !volume_path.is_file() {
            return Err(errno(libc::ENOENT));
        }
        std::fs::create_dir_all(self.requests_dir())?;
        let request_file = self
            .requests_dir()
            .join(format!("{}.{}", request.media, request.vsn));
        let mut marker = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&request_file)
        {
            Ok(marker) => marker,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(errno(libc::EBUSY));
            }
            Err(e) => return Err(e),
        };
        let opened = writeln!(
            marker,
            "{} {} {} {} {}",
            request.flags, request.file_id, request.owner_id, request.group_id, oflag
        )
        .and_then(|()| {
            let mut options = std::fs::OpenOptions::new();
            match oflag & libc::O_ACCMODE {
                libc::O_WRONLY => options.write(true),
                libc::O_RDWR => options.read(true).write(true),
                _ => options.read(true),
            };
            options.open(&volume_path)
        });
        match opened {
            Ok(file) => {
                tracing::info!("Loaded volume {}.{}", request.media, request.vsn);
                Ok(LoadedVolume {
                    file,
                    block_size: self.block_size,
                    request_file,
                })
            }
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&request_file) {
                    tracing::warn!("Failed to remove request file {request_file:?}: {cleanup}");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> (tempfile::TempDir, DirectoryLibrary) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("lt")).unwrap();
        std::fs::write(dir.path().join("lt").join("VOL001"), vec![7u8; 4096]).unwrap();
        let library = DirectoryLibrary::new(dir.path());
        (dir, library)
    }

    #[test]
    fn vsn_rules() {
        assert!(is_valid_vsn("VOL001"));
        assert!(is_valid_vsn("A"));
        assert!(is_valid_vsn("CLN_1."));
        assert!(!is_valid_vsn(""));
        assert!(!is_valid_vsn("VOL0001"));
        assert!(!is_valid_vsn("vol001"));
        assert!(!is_valid_vsn("VOL 01"));
    }

    #[test]
    fn load_marks_volume_busy_until_unloaded() {
        let (_dir, library) = library();
        let request = VolumeRequest::new("lt", "VOL001");
        let volume = library.load(&request, libc::O_RDONLY).unwrap();
        assert_eq!(volume.block_size, DEFAULT_BLOCK_SIZE);
        assert!(volume.request_file.exists());
        let err = library.load(&request, libc::O_RDONLY).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
        library.unload(&volume.request_file).unwrap();
        assert!(!volume.request_file.exists());
        // unloading twice is harmless
        library.unload(&volume.request_file).unwrap();
        library.load(&request, libc::O_RDONLY).unwrap();
    }

    #[test]
    fn bad_requests() {
        let (_dir, library) = library();
        let err = library
            .load(&VolumeRequest::new("lt", "bad vsn"), libc::O_RDONLY)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        let err = library
            .load(&VolumeRequest::new("lt", "NOPE01"), libc::O_RDONLY)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        let err = library
            .load(&VolumeRequest::new("LT", "VOL001"), libc::O_RDONLY)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert!(!library.requests_dir().join("lt.NOPE01").exists());
    }
}
