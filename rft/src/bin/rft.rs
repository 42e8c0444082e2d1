use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use remote::protocol::command::{CreateAttr, VolumeRequest};
use rft_tools_rft::{ClientConfig, Session};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rft",
    version,
    about = "Remote file transfer client - move files to and from `rftd` hosts",
    long_about = "`rft` runs remote file transfer operations against an `rftd` host. With the default host \
(localhost) the operations run in-process without a daemon.

EXAMPLE:
    # Copy a file to a remote host
    rft --host tapehost put ./data.bin /sam1/data.bin

    # Show capacity of a SAM filesystem including released data
    rft --host tapehost df /sam1 --offline"
)]
struct Args {
    // Connection
    /// Host running rftd; empty or `localhost` runs operations in-process
    #[arg(
        long,
        default_value = "localhost",
        value_name = "HOST",
        help_heading = "Connection"
    )]
    host: String,

    /// Control port of rftd
    #[arg(
        long,
        default_value_t = remote::protocol::DEFAULT_PORT,
        value_name = "PORT",
        help_heading = "Connection"
    )]
    port: u16,

    /// Restrict dataport listeners to port ranges (e.g., "8000-8999,10000-10999")
    #[arg(long, value_name = "RANGES", help_heading = "Connection")]
    dataport_ranges: Option<remote::PortRanges>,

    /// Seconds allowed per connection attempt and per dataport accept
    #[arg(
        long,
        default_value = "15",
        value_name = "SECONDS",
        help_heading = "Connection"
    )]
    conn_timeout_sec: u64,

    /// Control connection attempts before giving up
    #[arg(
        long,
        default_value = "3",
        value_name = "N",
        help_heading = "Connection"
    )]
    connect_attempts: usize,

    // Output
    /// Print results as JSON
    #[arg(long, help_heading = "Output")]
    json: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    quiet: bool,

    /// Enable file-based debug logging with given prefix
    #[arg(long, value_name = "PREFIX", help_heading = "Output")]
    debug_log_prefix: Option<String>,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    #[command(subcommand)]
    command: Cmd,
}

fn parse_mode(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value, 8).map_err(|e| format!("invalid octal mode {value:?}: {e}"))
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Copy a remote file to a local path
    Get {
        remote: String,
        local: std::path::PathBuf,
        /// Bytes requested per read
        #[arg(long, default_value = "1MiB", value_name = "SIZE")]
        buffer_size: bytesize::ByteSize,
    },
    /// Copy a local file to a remote path, keeping its mode and ownership
    Put {
        local: std::path::PathBuf,
        remote: String,
        /// Bytes streamed per send
        #[arg(long, default_value = "1MiB", value_name = "SIZE")]
        buffer_size: bytesize::ByteSize,
    },
    /// Show mode, ownership and size of a path
    Stat { path: String },
    /// Show capacity of the filesystem at a mount point
    Df {
        mount_point: String,
        /// Count released (offline) data on SAM filesystems
        #[arg(long)]
        offline: bool,
    },
    /// Sum the sizes of regular files under a path
    Du { path: String },
    /// List a directory
    Ls { path: String },
    /// Create a directory
    Mkdir {
        path: String,
        /// Octal permission bits
        #[arg(long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },
    /// Remove a file
    Rm { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Check whether a path is a mount point
    Mounted { mount_point: String },
    /// Set archive attributes, e.g. "c12i" or "n"
    Archive { path: String, ops: String },
    /// Check whether a path can be examined on the host (single attempt)
    Accessible { path: String },
    /// Load a removable media volume, report its position and unload it
    VolInfo {
        media: String,
        vsn: String,
        /// Block to position the volume at before reporting
        #[arg(long, value_name = "BLOCK")]
        seek: Option<u64>,
    },
}

fn print_result<T: serde::Serialize>(
    json: bool,
    value: &T,
    text: impl FnOnce(&T) -> String,
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", text(value));
    }
    Ok(())
}

fn buffer_len(size: bytesize::ByteSize) -> anyhow::Result<usize> {
    let len = usize::try_from(size.as_u64())
        .with_context(|| format!("buffer size {size} is too large"))?;
    anyhow::ensure!(len > 0, "buffer size must not be zero");
    Ok(len)
}

async fn get(
    session: &mut Session,
    remote: &str,
    local: &std::path::Path,
    buffer: usize,
) -> anyhow::Result<u64> {
    session
        .open(remote, libc::O_RDONLY, None)
        .await
        .with_context(|| format!("failed to open {remote} on {}", session.host()))?;
    let mut file = tokio::fs::File::create(local)
        .await
        .with_context(|| format!("failed to create {local:?}"))?;
    let mut buf = vec![0u8; buffer];
    let mut total = 0u64;
    loop {
        let n = session
            .read(&mut buf)
            .await
            .with_context(|| format!("failed reading {remote}"))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .await
            .with_context(|| format!("failed writing {local:?}"))?;
        total += n as u64;
    }
    file.flush().await?;
    session
        .close()
        .await
        .with_context(|| format!("failed to close {remote}"))?;
    Ok(total)
}

async fn put(
    session: &mut Session,
    local: &std::path::Path,
    remote: &str,
    buffer: usize,
) -> anyhow::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    let mut file = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("failed to open {local:?}"))?;
    let metadata = file.metadata().await?;
    let attr = CreateAttr {
        mode: metadata.mode() & 0o7777,
        uid: metadata.uid(),
        gid: metadata.gid(),
    };
    session
        .open(remote, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, Some(attr))
        .await
        .with_context(|| format!("failed to create {remote} on {}", session.host()))?;
    let size = metadata.len();
    session.store(size).await?;
    let mut buf = vec![0u8; buffer];
    let mut sent = 0u64;
    while sent < size {
        let want = buffer.min(usize::try_from(size - sent).unwrap_or(buffer));
        let n = file.read(&mut buf[..want]).await?;
        anyhow::ensure!(n > 0, "{local:?} shrank to {sent} bytes while sending");
        session.send(&buf[..n]).await?;
        sent += n as u64;
    }
    session
        .close()
        .await
        .with_context(|| format!("storing {remote} failed"))?;
    Ok(sent)
}

async fn list(
    session: &mut Session,
    path: &str,
) -> anyhow::Result<Vec<remote::protocol::reply::DirEntry>> {
    let dir = session
        .opendir(path)
        .await
        .with_context(|| format!("failed to open directory {path}"))?;
    let mut entries = Vec::new();
    let listed = async {
        while let Some(entry) = session.readdir(dir).await? {
            entries.push(entry);
        }
        Ok::<_, remote::Error>(())
    }
    .await;
    session.closedir(dir).await?;
    listed.with_context(|| format!("failed to read directory {path}"))?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

async fn vol_info(
    session: &mut Session,
    media: &str,
    vsn: &str,
    seek: Option<u64>,
) -> anyhow::Result<remote::protocol::reply::VolInfo> {
    session
        .load_vol(&VolumeRequest::new(media, vsn), libc::O_RDONLY)
        .await
        .with_context(|| format!("failed to load volume {media}.{vsn}"))?;
    let info = async {
        if let Some(block) = seek {
            session.seek_vol(block).await?;
        }
        session.get_vol_info().await
    }
    .await;
    session.unload_vol(0).await?;
    Ok(info?)
}

#[instrument(skip(session))]
async fn execute(session: &mut Session, command: &Cmd, json: bool) -> anyhow::Result<()> {
    match command {
        Cmd::Get {
            remote,
            local,
            buffer_size,
        } => {
            let bytes = get(session, remote, local, buffer_len(*buffer_size)?).await?;
            tracing::info!("Received {bytes} bytes from {remote}");
            print_result(json, &serde_json::json!({ "bytes": bytes }), |_| {
                format!("{bytes} bytes")
            })
        }
        Cmd::Put {
            local,
            remote,
            buffer_size,
        } => {
            let bytes = put(session, local, remote, buffer_len(*buffer_size)?).await?;
            tracing::info!("Stored {bytes} bytes to {remote}");
            print_result(json, &serde_json::json!({ "bytes": bytes }), |_| {
                format!("{bytes} bytes")
            })
        }
        Cmd::Stat { path } => {
            let info = session.stat(path).await?;
            print_result(json, &info, |info| {
                format!(
                    "mode {:o} uid {} gid {} size {}",
                    info.mode, info.uid, info.gid, info.size
                )
            })
        }
        Cmd::Df {
            mount_point,
            offline,
        } => {
            let fs = session.statvfs(mount_point, *offline).await?;
            print_result(json, &fs, |fs| {
                format!(
                    "{} {} of {} free ({})",
                    mount_point,
                    bytesize::ByteSize(fs.bfree * fs.frsize),
                    bytesize::ByteSize(fs.blocks * fs.frsize),
                    fs.basetype
                )
            })
        }
        Cmd::Du { path } => {
            let used = session.space_used(path).await?;
            print_result(json, &serde_json::json!({ "used": used }), |_| {
                format!("{used}\t{path}")
            })
        }
        Cmd::Ls { path } => {
            let entries = list(session, path).await?;
            print_result(json, &entries, |entries| {
                entries
                    .iter()
                    .map(|e| format!("{}{}", e.name, if e.is_dir { "/" } else { "" }))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Cmd::Mkdir { path, mode } => {
            let attr = CreateAttr {
                mode: *mode,
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
            };
            session.mkdir(path, attr).await?;
            Ok(())
        }
        Cmd::Rm { path } => Ok(session.unlink(path).await?),
        Cmd::Rmdir { path } => Ok(session.rmdir(path).await?),
        Cmd::Mounted { mount_point } => {
            let mounted = session.is_mounted(mount_point).await?;
            print_result(json, &serde_json::json!({ "mounted": mounted }), |_| {
                mounted.to_string()
            })
        }
        Cmd::Archive { path, ops } => Ok(session.archive_op(path, ops).await?),
        Cmd::VolInfo { media, vsn, seek } => {
            let info = vol_info(session, media, vsn, *seek).await?;
            print_result(json, &info, |info| {
                format!(
                    "block size {} position {} eq {}",
                    info.block_size, info.position, info.eq
                )
            })
        }
        Cmd::Accessible { path } => {
            let accessible = session.stat(path).await.is_ok();
            print_result(json, &serde_json::json!({ "accessible": accessible }), |_| {
                accessible.to_string()
            })
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<()> {
    let port_ranges = args.dataport_ranges.clone();
    let config = ClientConfig {
        port: args.port,
        connect_attempts: args.connect_attempts,
        conn_timeout: std::time::Duration::from_secs(args.conn_timeout_sec),
        port_ranges,
        ..Default::default()
    };
    if let Cmd::Accessible { path } = &args.command {
        let accessible = rft_tools_rft::is_accessible(&args.host, path, &config).await;
        return print_result(
            args.json,
            &serde_json::json!({ "accessible": accessible }),
            |_| accessible.to_string(),
        );
    }
    let mut session = Session::connect(&args.host, config)
        .await
        .with_context(|| format!("failed to connect to {}", args.host))?;
    let result = execute(&mut session, &args.command, args.json).await;
    if let Err(e) = session.disconnect().await {
        tracing::warn!("Disconnect from {} failed: {e}", args.host);
    }
    result
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let debug_log_file = args.debug_log_prefix.as_ref().map(|prefix| {
        let filename = common::generate_debug_log_filename(prefix);
        println!("rft: Debug logging to file: {filename}");
        filename
    });
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let tracing = common::TracingConfig { debug_log_file };
    let res = common::run(output, runtime, tracing, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
