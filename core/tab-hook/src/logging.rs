//! File logging for tab-hook.
//!
//! The hook's stdout carries replies, so diagnostics go to a daily-rolling
//! file under `~/.tabtime/logs`. The returned guard flushes the writer on
//! drop and must live until `main` returns.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "tab-hook.log";

pub fn init() -> Option<WorkerGuard> {
    let dir = dirs::home_dir()?.join(".tabtime").join(LOG_DIR);
    if fs_err::create_dir_all(&dir).is_err() {
        return None;
    }

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;

    Some(guard)
}
