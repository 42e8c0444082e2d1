//! Read-only filesystem queries: `STAT`, `STATVFS`, `SPACEUSED` and
//! `ISMOUNTED`.

use std::os::unix::fs::MetadataExt;

use async_recursion::async_recursion;
use remote::protocol::reply::{FsCapacity, StatInfo};

/// Filesystem type whose capacity can include offline file data.
pub const SAM_BASETYPE: &str = "samfs";

/// Unit of `st_blocks`.
const STAT_BLOCK_SIZE: u64 = 512;

fn stat_info(metadata: &std::fs::Metadata) -> StatInfo {
    StatInfo {
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        size: metadata.size(),
    }
}

pub async fn stat(path: &str) -> std::io::Result<StatInfo> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(stat_info(&metadata))
}

/// Mount table entry whose mount point is the longest prefix of `path`.
fn covering_mount(path: &std::path::Path) -> std::io::Result<Option<(std::path::PathBuf, String)>> {
    let mounts = procfs::process::Process::myself()
        .and_then(|process| process.mountinfo())
        .map_err(std::io::Error::other)?;
    Ok(mounts
        .into_iter()
        .filter(|mount| path.starts_with(&mount.mount_point))
        .max_by_key(|mount| mount.mount_point.as_os_str().len())
        .map(|mount| (mount.mount_point, mount.fs_type)))
}

#[allow(clippy::useless_conversion)] // statvfs field widths differ between targets
fn capacity(path: &std::path::Path) -> std::io::Result<FsCapacity> {
    let vfs = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    let basetype = match covering_mount(path) {
        Ok(Some((_, fs_type))) => fs_type,
        Ok(None) => "-".to_string(),
        Err(e) => {
            tracing::debug!("Mount table unavailable: {e}");
            "-".to_string()
        }
    };
    Ok(FsCapacity {
        bfree: u64::from(vfs.blocks_free()),
        blocks: u64::from(vfs.blocks()),
        frsize: u64::from(vfs.fragment_size()),
        basetype,
    })
}

/// Capacity of the filesystem holding `mount_point`. With `offline` set, a
/// SAM filesystem also counts the data of released files, in fragment
/// units.
pub async fn statvfs(mount_point: &str, offline: bool) -> std::io::Result<FsCapacity> {
    let path = tokio::fs::canonicalize(mount_point).await?;
    let mut fs = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || capacity(&path))
            .await
            .map_err(std::io::Error::other)??
    };
    if offline && fs.basetype == SAM_BASETYPE && fs.frsize > 0 {
        let metadata = tokio::fs::metadata(&path).await?;
        let released = offline_bytes(&path, metadata.dev()).await;
        tracing::debug!("Adding {released} bytes of offline data to {mount_point}");
        fs.blocks += released / fs.frsize;
    }
    Ok(fs)
}

/// Bytes of file data not resident on disk, over the tree at `dir` that
/// lives on device `dev`.
#[async_recursion]
async fn offline_bytes(dir: &std::path::Path, dev: u64) -> u64 {
    let mut total = 0;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = tokio::fs::symlink_metadata(entry.path()).await else {
            continue;
        };
        if metadata.dev() != dev {
            continue;
        }
        if metadata.is_dir() {
            total += offline_bytes(&entry.path(), dev).await;
        } else if metadata.is_file() {
            total += metadata
                .size()
                .saturating_sub(metadata.blocks() * STAT_BLOCK_SIZE);
        }
    }
    total
}

/// Sum of the sizes of all regular files under `path`. Entries that cannot
/// be examined are skipped.
pub async fn space_used(path: &str) -> std::io::Result<u64> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.is_dir() {
        Ok(accumulate(std::path::Path::new(path)).await)
    } else if metadata.is_file() {
        Ok(metadata.size())
    } else {
        Ok(0)
    }
}

#[async_recursion]
async fn accumulate(dir: &std::path::Path) -> u64 {
    let mut used = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Skipping {dir:?}: {e}");
            return 0;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stopped reading {dir:?}: {e}");
                break;
            }
        };
        let path = entry.path();
        let Ok(metadata) = tokio::fs::metadata(&path).await else {
            continue;
        };
        if metadata.is_dir() {
            used += accumulate(&path).await;
        } else if metadata.is_file() {
            used += metadata.size();
        }
    }
    used
}

/// True when `mount_point` is the root of a mounted filesystem.
pub async fn is_mounted(mount_point: &str) -> bool {
    let Ok(path) = tokio::fs::canonicalize(mount_point).await else {
        return false;
    };
    let lookup = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || covering_mount(&path)).await
    };
    match lookup {
        Ok(Ok(Some((mount, _)))) => return mount == path,
        Ok(Ok(None)) => return false,
        Ok(Err(e)) => tracing::debug!("Mount table unavailable: {e}"),
        Err(e) => tracing::debug!("Mount table lookup failed: {e}"),
    }
    // without a mount table, a mount point is where the device changes
    let Some(parent) = path.parent() else {
        return true;
    };
    match (
        tokio::fs::metadata(&path).await,
        tokio::fs::metadata(parent).await,
    ) {
        (Ok(here), Ok(above)) => here.dev() != above.dev(),
        _ => false,
    }
}
