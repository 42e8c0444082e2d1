//! Configuration types for runtime and output settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
}

impl OutputConfig {
    /// Default filter directive for the configured verbosity.
    pub fn level(&self) -> &'static str {
        if self.quiet {
            return "off";
        }
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Tracing configuration
#[derive(Debug, Default, Clone)]
pub struct TracingConfig {
    /// Debug log file path; logs go to stderr when unset
    pub debug_log_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_filter_level() {
        let mut output = OutputConfig::default();
        assert_eq!(output.level(), "error");
        output.verbose = 1;
        assert_eq!(output.level(), "info");
        output.verbose = 2;
        assert_eq!(output.level(), "debug");
        output.verbose = 7;
        assert_eq!(output.level(), "trace");
        output.quiet = true;
        assert_eq!(output.level(), "off");
    }
}
