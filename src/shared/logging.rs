use std::path::Path;

use tracing::{info, Subscriber};
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the non-blocking writers flushing; drop it only at process exit.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// Initialize logging for the service: daily rolling file plus console, or
/// console only when `log_dir` is not writable. Filter comes from `RUST_LOG`.
pub fn init_service_logging(log_dir: &Path, service_name: &str) -> anyhow::Result<LogGuards> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (stdout_writer, stdout_guard) = non_blocking(std::io::stdout());

    if !log_dir_writable(log_dir) {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer(stdout_writer))
            .try_init()?;

        info!(
            "Logging initialized - console output only (could not write to {})",
            log_dir.display()
        );
        return Ok(LogGuards {
            _guards: vec![stdout_guard],
        });
    }

    if let Err(e) = rotate_logs_on_startup(log_dir, service_name) {
        eprintln!("Could not rotate previous log file: {e}");
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{service_name}.log"));
    let (file_writer, file_guard) = non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer(stdout_writer))
        .try_init()?;

    info!(
        "Logging initialized - logs will be written to {}/{}.log",
        log_dir.display(),
        service_name
    );

    Ok(LogGuards {
        _guards: vec![file_guard, stdout_guard],
    })
}

fn console_layer<S>(writer: NonBlocking) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer().with_writer(writer).with_ansi(true).with_target(false)
}

fn log_dir_writable(log_dir: &Path) -> bool {
    let test_file = log_dir.join(".test_write");
    std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(&test_file))
        .and_then(|_| std::fs::remove_file(&test_file))
        .is_ok()
}

pub fn rotate_logs_on_startup(log_dir: &Path, service_name: &str) -> std::io::Result<()> {
    let log_path = log_dir.join(format!("{service_name}.log"));

    if log_path.exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = log_dir.join(format!("{service_name}.{timestamp}.log"));
        std::fs::rename(&log_path, &backup_path)?;
    }

    Ok(())
}
