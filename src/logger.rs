//! Logging setup for decay-tree-fitter binaries and benchmarks
//!
//! The library only emits `tracing` events: per-pass χ² at `debug!` (promoted to `info!` with
//! `FitConfig::verbose`), per-constraint traces at `trace!`, and rejected inputs or failed fits at
//! `warn!`. Installing a subscriber is left to the executable; this module provides the standard
//! one.
//!
//! Batch fits run on rayon workers, so the format is tuned for many short interleaved events:
//! - Compact single-line records
//! - Time since start-up instead of wall-clock time
//! - Thread ids, to tell concurrent events apart
//! - Module target, so `RUST_LOG=decay_tree_fitter::optimizer=debug` reads naturally

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::Uptime;

/// Install the standard subscriber at INFO
///
/// # Example
/// ```no_run
/// use decay_tree_fitter::init_logger;
///
/// fn main() {
///     init_logger();
///     tracing::info!("Fitting started");
/// }
/// ```
///
/// # Environment Variables
/// ```bash
/// RUST_LOG=debug cargo run --bin fit_decay_tree
/// RUST_LOG=decay_tree_fitter::core::chain=trace cargo run --bin fit_decay_tree -- --events 1
/// ```
pub fn init_logger() -> bool {
    init_logger_with_level(Level::INFO)
}

/// Install the standard subscriber with `default_level` as the fallback filter
///
/// `RUST_LOG` directives take precedence over `default_level`. Returns false when a global
/// subscriber is already installed, in which case the existing one is kept.
pub fn init_logger_with_level(default_level: Level) -> bool {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter(default_level))
        .with_timer(Uptime::default())
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .is_ok()
}

fn filter(default_level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_keeps_first_subscriber() {
        init_logger_with_level(Level::WARN);
        assert!(!init_logger());
    }
}
