use once_cell::sync::Lazy;
use std::path::Path;
use std::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps the background writer of the log file alive until the process exits.
static FILE_GUARD: Lazy<Mutex<Option<WorkerGuard>>> = Lazy::new(|| Mutex::new(None));

/// Initialise logging. In debug mode the default level is `debug`, otherwise
/// `info`. The level can be overridden via the `RUST_LOG` environment variable
/// only when debug logging is enabled.
///
/// When `log_file` is given, every line is also appended to that file. Calling
/// this more than once keeps the first subscriber.
pub fn init(debug: bool, log_file: Option<&Path>) {
    // Without debug logging the level is pinned to `info` so that a stray
    // `RUST_LOG` in the user's environment does not flood the trace file.
    let level = if debug { "debug" } else { "info" };

    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    } else {
        EnvFilter::new(level)
    };

    let file_layer = log_file.and_then(open_log_file).map(|writer| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init();
}

fn open_log_file(path: &Path) -> Option<tracing_appender::non_blocking::NonBlocking> {
    let file_name = path.file_name()?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir().ok()?,
    };
    if let Err(err) = std::fs::create_dir_all(&dir) {
        eprintln!("unable to create log directory {}: {err}", dir.display());
        return None;
    }

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let mut slot = FILE_GUARD.lock().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        // A subscriber is already installed; its file keeps receiving output.
        return None;
    }
    *slot = Some(guard);
    Some(writer)
}
