use anyhow::Context;
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rftd",
    version,
    about = "Remote file transfer daemon - serves file and volume operations to `rft` clients",
    long_about = "`rftd` accepts remote file transfer sessions. Each session gets one control connection and a crew of \
dataports the daemon connects back to; bulk data is striped across the dataports.

EXAMPLE:
    # Serve on the default port with 4 dataports of 1MiB blocks per session
    rftd --dataports 4 --blksize 1MiB

    # Serve removable media from a directory tree (<root>/<media>/<vsn>)
    rftd --media-root /srv/media --eq 30"
)]
struct Args {
    // Network
    /// Address to listen on for control connections
    #[arg(
        long,
        default_value = "0.0.0.0:7105",
        value_name = "ADDR",
        help_heading = "Network"
    )]
    bind: std::net::SocketAddr,

    /// Number of dataports offered to each session
    #[arg(long, default_value = "1", value_name = "N", help_heading = "Network")]
    dataports: usize,

    /// Largest block sent on a dataport
    ///
    /// Accepts byte sizes like "64KiB", "1MiB", or plain numbers in bytes.
    #[arg(
        long,
        default_value = "64KiB",
        value_name = "SIZE",
        help_heading = "Network"
    )]
    blksize: bytesize::ByteSize,

    /// Dataport socket buffer size, 0 keeps the OS default
    #[arg(long, default_value = "0", value_name = "SIZE", help_heading = "Network")]
    tcp_window: bytesize::ByteSize,

    /// Seconds an idle dataport waits before polling again
    #[arg(
        long,
        default_value = "5",
        value_name = "SECONDS",
        help_heading = "Network"
    )]
    read_timeout_sec: u64,

    /// Seconds allowed for connecting back to a client dataport
    #[arg(
        long,
        default_value = "15",
        value_name = "SECONDS",
        help_heading = "Network"
    )]
    conn_timeout_sec: u64,

    /// Longest control line accepted
    #[arg(
        long,
        default_value = "4096",
        value_name = "BYTES",
        help_heading = "Network"
    )]
    cmd_buffer_size: usize,

    // Removable media
    /// Directory holding removable media volumes as <media>/<vsn> files
    ///
    /// Without it, volume commands fail with ENODEV.
    #[arg(long, value_name = "PATH", help_heading = "Removable media")]
    media_root: Option<std::path::PathBuf>,

    /// Equipment ordinal reported for loaded volumes
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Removable media"
    )]
    eq: i32,

    // Output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    quiet: bool,

    /// Enable file-based debug logging with given prefix
    ///
    /// Example: /tmp/rftd-log creates /tmp/rftd-log-YYYY-MM-DDTHH-MM-SS-RANDOM
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
}

fn server_config(args: &Args) -> anyhow::Result<rft_tools_rft::ServerConfig> {
    let blksize = usize::try_from(args.blksize.as_u64())
        .with_context(|| format!("block size {} is too large", args.blksize))?;
    let tcp_window = usize::try_from(args.tcp_window.as_u64())
        .with_context(|| format!("TCP window {} is too large", args.tcp_window))?;
    let media = args.media_root.as_ref().map(|root| {
        std::sync::Arc::new(rft_tools_rft::volume::DirectoryLibrary::new(root))
            as std::sync::Arc<dyn rft_tools_rft::volume::MediaLibrary>
    });
    Ok(rft_tools_rft::ServerConfig {
        dataports: args.dataports,
        blksize,
        tcp_window,
        read_timeout: std::time::Duration::from_secs(args.read_timeout_sec),
        conn_timeout: std::time::Duration::from_secs(args.conn_timeout_sec),
        cmd_buffer_size: args.cmd_buffer_size,
        host: rft_tools_rft::HostConfig {
            media,
            eq: args.eq,
            ..Default::default()
        },
    })
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<()> {
    if let Some(root) = &args.media_root {
        let metadata = tokio::fs::metadata(root)
            .await
            .with_context(|| format!("media root {root:?} is not accessible"))?;
        anyhow::ensure!(metadata.is_dir(), "media root {root:?} is not a directory");
    }
    let config = server_config(&args)?;
    let server = rft_tools_rft::Server::bind(args.bind, config).await?;
    let cancel = tokio_util::sync::CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Interrupted, shutting down");
                    cancel.cancel();
                }
                Err(e) => tracing::error!("Failed to listen for interrupt: {e}"),
            }
        });
    }
    server.run(cancel).await
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let debug_log_file = args.debug_log_prefix.as_ref().map(|prefix| {
        let filename = common::generate_debug_log_filename(prefix);
        println!("rftd: Debug logging to file: {filename}");
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
