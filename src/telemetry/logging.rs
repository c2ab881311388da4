use crate::config::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber: console output plus an optional daily log file.
///
/// `RUST_LOG` wins over `config.level` when set.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},rebalancer=debug,hyper=warn", config.level))
    });

    let file_layer = config.dir.as_deref().and_then(file_layer);
    let file_logging_enabled = file_layer.is_some();

    let console_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if let (true, Some(dir)) = (file_logging_enabled, config.dir.as_deref()) {
        eprintln!("Logging to: {}/rebalancer.log", dir);
    }
}

/// Minimal logging for one-shot CLI commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn file_layer<S>(log_dir: &str) -> Option<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    // tracing_appender::rolling::daily panics if it cannot create the file, so
    // check writability first.
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Warning: Could not create log directory {} ({}), file logging disabled",
            log_dir, e
        );
        return None;
    }
    let marker = std::path::Path::new(log_dir).join(".rebalancer_write_test");
    if let Err(e) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&marker)
    {
        eprintln!(
            "Warning: Could not write to log directory {} ({}), file logging disabled",
            log_dir, e
        );
        return None;
    }
    let _ = std::fs::remove_file(&marker);

    let appender = tracing_appender::rolling::daily(log_dir, "rebalancer.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    // Process-lifetime guard; dropping it would stop the writer thread.
    Box::leak(Box::new(guard));

    Some(
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed(),
    )
}
