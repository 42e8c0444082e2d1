//! Archive attribute requests (`ARCHIVEOP`).
//!
//! The ops string is a sequence of single-letter operations applied left to
//! right. `c` followed by copy digits `1`-`4` selects the copies that later
//! `i` and `w` letters refer to; without a `c` all copies are selected.

/// Longest ops string accepted.
pub const MAX_OPS_LEN: usize = 32;

/// Copy mask meaning "all four copies".
const ALL_COPIES: u8 = 0x0f;

/// Wait mask set by `W`: wait until the file is fully archived.
pub const WAIT_ARCHIVED: u8 = 0x20;

/// Extended attribute the [`XattrArchive`] backend records requests in.
pub const ARCHIVE_XATTR: &str = "user.sam.archive";

/// Decoded `ARCHIVEOP` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveRequest {
    /// `d`: reset archive attributes to the defaults.
    pub reset: bool,
    /// `C`: allow archiving while the file is open for write.
    pub concurrent: bool,
    /// `I`: accept inconsistent copies.
    pub inconsistent: bool,
    /// `n`: never archive.
    pub never: bool,
    /// `i`: copies to archive immediately.
    pub immediate: u8,
    /// `w`/`W`: copies to wait for.
    pub wait: Option<u8>,
}

impl ArchiveRequest {
    /// Parse an ops string. `superuser` gates the `n` operation.
    pub fn parse(ops: &str, superuser: bool) -> std::io::Result<Self> {
        if ops.len() > MAX_OPS_LEN {
            return Err(std::io::Error::from_raw_os_error(libc::E2BIG));
        }
        let mut request = Self::default();
        let mut copies = ALL_COPIES;
        let mut chars = ops.chars().peekable();
        while let Some(op) = chars.next() {
            match op {
                'c' => {
                    copies = 0;
                    while let Some(digit) = chars.next_if(|c| ('1'..='4').contains(c)) {
                        copies |= 1 << (digit as u8 - b'1');
                    }
                }
                'C' => request.concurrent = true,
                'I' => request.inconsistent = true,
                'd' => {
                    request.reset = true;
                    request.never = false;
                    request.concurrent = false;
                    request.inconsistent = false;
                    request.immediate = 0;
                }
                'i' => request.immediate |= copies,
                'n' => {
                    if !superuser {
                        return Err(std::io::Error::from_raw_os_error(libc::EACCES));
                    }
                    request.never = true;
                }
                'w' => request.wait = Some(copies),
                'W' => request.wait = Some(WAIT_ARCHIVED),
                _ => return Err(std::io::Error::from_raw_os_error(libc::EINVAL)),
            }
        }
        Ok(request)
    }
}

fn copy_digits(mask: u8) -> String {
    (0..4u8)
        .filter(|n| mask & (1 << n) != 0)
        .map(|n| char::from(b'1' + n))
        .collect()
}

impl std::fmt::Display for ArchiveRequest {
    /// Canonical ops string; parses back to the same request.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reset {
            f.write_str("d")?;
        }
        if self.concurrent {
            f.write_str("C")?;
        }
        if self.inconsistent {
            f.write_str("I")?;
        }
        if self.never {
            f.write_str("n")?;
        }
        if self.immediate != 0 {
            write!(f, "c{}i", copy_digits(self.immediate))?;
        }
        match self.wait {
            Some(WAIT_ARCHIVED) => f.write_str("W")?,
            Some(mask) => write!(f, "c{}w", copy_digits(mask))?,
            None => {}
        }
        Ok(())
    }
}

/// Backend applying archive requests to files.
pub trait ArchiveControl: std::fmt::Debug + Send + Sync {
    fn apply(&self, path: &std::path::Path, request: &ArchiveRequest) -> std::io::Result<()>;
}

/// Records each request as an extended attribute on the file.
#[derive(Debug, Default, Clone, Copy)]
pub struct XattrArchive;

impl ArchiveControl for XattrArchive {
    fn apply(&self, path: &std::path::Path, request: &ArchiveRequest) -> std::io::Result<()> {
        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
        let c_name = std::ffi::CString::new(ARCHIVE_XATTR)
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
        let value = request.to_string();
        // SAFETY: both strings are NUL terminated and outlive the call; the
        // value pointer is valid for value.len() bytes.
        let rc = unsafe {
            libc::setxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        tracing::debug!("Recorded archive request {value:?} on {path:?}");
        Ok(())
    }
}

/// Validate `ops` for the calling user and hand it to `control`.
pub async fn archive_op(
    control: std::sync::Arc<dyn ArchiveControl>,
    path: &str,
    ops: &str,
) -> std::io::Result<()> {
    let request = ArchiveRequest::parse(ops, nix::unistd::geteuid().is_root())?;
    let path = std::path::PathBuf::from(path);
    tokio::task::spawn_blocking(move || control.apply(&path, &request))
        .await
        .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errno(result: std::io::Result<ArchiveRequest>) -> i32 {
        result.unwrap_err().raw_os_error().unwrap()
    }

    #[test]
    fn copies_select_what_immediate_and_wait_apply_to() {
        let request = ArchiveRequest::parse("c13iw", false).unwrap();
        assert_eq!(request.immediate, 0b101);
        assert_eq!(request.wait, Some(0b101));
        let request = ArchiveRequest::parse("i", false).unwrap();
        assert_eq!(request.immediate, ALL_COPIES);
        // bare c selects nothing
        let request = ArchiveRequest::parse("ci", false).unwrap();
        assert_eq!(request.immediate, 0);
        let request = ArchiveRequest::parse("c2wW", false).unwrap();
        assert_eq!(request.wait, Some(WAIT_ARCHIVED));
    }

    #[test]
    fn defaults_clear_earlier_flags() {
        let request = ArchiveRequest::parse("CIc1id", false).unwrap();
        assert!(request.reset);
        assert!(!request.concurrent && !request.inconsistent);
        assert_eq!(request.immediate, 0);
        let request = ArchiveRequest::parse("dC", false).unwrap();
        assert!(request.reset && request.concurrent);
    }

    #[test]
    fn rejected_ops() {
        assert_eq!(errno(ArchiveRequest::parse("x", false)), libc::EINVAL);
        assert_eq!(errno(ArchiveRequest::parse("c5", false)), libc::EINVAL);
        assert_eq!(errno(ArchiveRequest::parse("n", false)), libc::EACCES);
        assert!(ArchiveRequest::parse("n", true).unwrap().never);
        let long = "C".repeat(MAX_OPS_LEN + 1);
        assert_eq!(errno(ArchiveRequest::parse(&long, true)), libc::E2BIG);
        assert!(ArchiveRequest::parse(&"C".repeat(MAX_OPS_LEN), false).is_ok());
    }

    #[test]
    fn canonical_form_parses_back() {
        for ops in ["", "d", "CI", "i", "c24i", "c1w", "W", "dCc3ic12w", "n", "c3iw"] {
            let request = ArchiveRequest::parse(ops, true).unwrap();
            let again = ArchiveRequest::parse(&request.to_string(), true).unwrap();
            assert_eq!(request, again, "{ops}");
        }
    }

    #[tokio::test]
    async fn xattr_backend_records_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"data").unwrap();
        let control: std::sync::Arc<dyn ArchiveControl> = std::sync::Arc::new(XattrArchive);
        match archive_op(control.clone(), path.to_str().unwrap(), "c1i").await {
            Ok(()) => {}
            // some filesystems used for temp dirs have no user xattrs
            Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => return,
            Err(e) => panic!("unexpected error: {e}"),
        }
        let missing = dir.path().join("missing");
        let err = archive_op(control, missing.to_str().unwrap(), "i")
            .await
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
