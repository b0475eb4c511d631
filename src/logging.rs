//! Logging setup for the binary.
//!
//! Logs always go to a daily rolling file under the platform state directory
//! (`~/.local/state/dockforward/` on Linux), because stdout belongs to the
//! interactive view. A stderr layer is added when `RUST_LOG` is set or
//! `--log-stderr` is passed.

use crate::cli::{Cli, LogFormat};
use std::io::Write;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// The directory under the state dir where logs are stored.
const LOG_DIR_NAME: &str = "dockforward";

/// The base filename for the rolling log file.
const LOG_FILE_NAME: &str = "dockforward.log";

/// Crates whose debug output drowns ours unless explicitly asked for.
const NOISY_CRATES: &[&str] = &["russh", "hyper", "hyper_util", "h2", "tokio"];

/// A writer that wraps stderr and flushes after each write.
/// This ensures log lines are immediately visible when stderr is piped.
struct FlushingStderr;

impl Write for FlushingStderr {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let n = handle.write(buf)?;
        handle.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

/// Initialise the tracing subscriber with file + optional stderr layers.
///
/// Returns a [`WorkerGuard`] that must be held for the lifetime of the
/// program; dropping it flushes and closes the log file writer.
pub fn init_logging(cli: &Cli) -> WorkerGuard {
    let log_dir = log_directory();

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "warning: could not create log directory {}: {e}",
            log_dir.display()
        );
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let rust_log = std::env::var("RUST_LOG").ok();
    let stderr_layer = if rust_log.is_some() || cli.log_stderr {
        Some(stderr_layer(cli))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(build_filter(&cli.log_level, rust_log.as_deref()))
        .with(file_layer)
        .with(stderr_layer)
        .init();

    guard
}

fn stderr_layer<S>(cli: &Cli) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let use_color = cli.color.should_enable();
    match cli.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(|| FlushingStderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(use_color)
            .with_target(false)
            .with_writer(|| FlushingStderr)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(use_color)
            .with_target(false)
            .with_writer(|| FlushingStderr)
            .boxed(),
    }
}

/// `RUST_LOG` if set, else `level`; noisy dependencies capped at `warn`
/// unless `RUST_LOG` names them.
fn build_filter(level: &str, rust_log: Option<&str>) -> EnvFilter {
    let mut filter = match rust_log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::new(level),
    };

    for krate in NOISY_CRATES {
        if rust_log.is_some_and(|r| r.contains(*krate)) {
            continue;
        }
        if let Ok(directive) = format!("{krate}=warn").parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Resolve the log directory path.
///
/// Falls back to `~/.local/state/dockforward/` when the platform has no state
/// directory, then to the current directory.
fn log_directory() -> PathBuf {
    if let Some(state) = dirs::state_dir() {
        return state.join(LOG_DIR_NAME);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".local").join("state").join(LOG_DIR_NAME);
    }
    PathBuf::from(".")
}
