use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::config::WatcherConfig;

/// Filter for our own crate at the requested verbosity, `warn` for dependencies
fn build_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };

    Ok(EnvFilter::from_default_env()
        .add_directive(format!("{}={}", env!("CARGO_CRATE_NAME"), level).parse()?)
        .add_directive("warn".parse()?))
}

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = build_filter(verbose)?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)?;
        }

        // Append so restarts of the daemon keep earlier history
        let file = fs::OpenOptions::new().create(true).append(true).open(log_file)?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

/// Create a default log file path
pub fn default_log_file() -> PathBuf {
    WatcherConfig::data_dir().join("watcher.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, Layer};

    /// Counts events that pass the filter
    struct EventCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for EventCounter {
        fn on_event(&self, _event: &Event<'_>, _ctx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn count_events(verbose: bool, emit: impl FnOnce()) -> usize {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry()
            .with(build_filter(verbose).unwrap())
            .with(EventCounter(count.clone()));

        tracing::subscriber::with_default(subscriber, emit);
        count.load(Ordering::SeqCst)
    }

    #[test]
    fn test_crate_events_pass_at_info() {
        assert!(module_path!().starts_with(env!("CARGO_CRATE_NAME")));

        let seen = count_events(false, || {
            tracing::info!("sweep finished");
            tracing::debug!("per-step detail");
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_verbose_enables_debug() {
        let seen = count_events(true, || {
            tracing::info!("sweep finished");
            tracing::debug!("per-step detail");
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_dependencies_limited_to_warn() {
        let seen = count_events(true, || {
            tracing::info!(target: "hyper::client", "connection pooled");
            tracing::warn!(target: "hyper::client", "connection reset");
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_default_log_file_name() {
        assert!(default_log_file().ends_with("watcher.log"));
    }
}
