//! Shared plumbing for the `rft` and `rftd` binaries: tokio runtime
//! construction, tracing subscriber setup and debug log naming.

use anyhow::Context;
use rand::Rng;

pub mod config;

pub use config::{OutputConfig, RuntimeConfig, TracingConfig};

/// Build a debug log file name from a prefix.
///
/// Example: `/tmp/rftd-log` becomes `/tmp/rftd-log-2024-05-01T10-11-12-a8Kd2`.
pub fn generate_debug_log_filename(prefix: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();
    format!("{prefix}-{timestamp}-{suffix}")
}

fn init_tracing(output: &OutputConfig, tracing_config: &TracingConfig) -> anyhow::Result<()> {
    // RUST_LOG wins over the verbosity flags when set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.level()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(output.verbose > 2);
    match &tracing_config.debug_log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open debug log file {path}"))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
        }
    }
    Ok(())
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder
        .thread_name("rft-worker")
        .build()
        .context("Failed to create tokio runtime")
}

/// Run `func` to completion on a freshly built runtime.
///
/// Returns `None` when setup or the future itself failed; the error has then
/// already been reported (unless `quiet`).
pub fn run<Fut, T>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing_config: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<T>
where
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    if let Err(error) = init_tracing(&output, &tracing_config) {
        if !output.quiet {
            eprintln!("{error:#}");
        }
        return None;
    }
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("{error:#}");
            if !output.quiet {
                eprintln!("{error:#}");
            }
            return None;
        }
    };
    let res = runtime.block_on(func());
    match res {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::error!("{error:#}");
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_log_filename_keeps_prefix() {
        let name = generate_debug_log_filename("/tmp/rftd-log");
        assert!(name.starts_with("/tmp/rftd-log-"));
        let other = generate_debug_log_filename("/tmp/rftd-log");
        assert_ne!(name, other);
    }

    #[test]
    fn runtime_honors_worker_count() {
        let runtime = build_runtime(&RuntimeConfig {
            max_workers: 2,
            max_blocking_threads: 4,
        })
        .unwrap();
        let value = runtime.block_on(async { 40 + 2 });
        assert_eq!(value, 42);
    }
}
