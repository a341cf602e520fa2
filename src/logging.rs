// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Logging setup (§7 propagation policy, §9 "closures capturing
//! outer-scope variables as logging state" re-architecture note): the
//! `tracing_subscriber`/`tracing-appender` stack this codebase's
//! `server_main` wires up, generalized into an explicit value that can be
//! pointed at a central `error_log.log` before a Session exists and then
//! retargeted at `<session>/output.log` once one is opened, instead of a
//! closure silently capturing an outer log path.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

/// Guards returned by `init`; must be held for the process lifetime or
/// buffered log lines are dropped on exit.
pub struct LoggingGuards {
    _file_guard: WorkerGuard,
    _stdout_guard: WorkerGuard,
}

/// Initializes the global `tracing` subscriber: info-level-by-default
/// (overridable via `RUST_LOG`), non-blocking writers to both stdout and
/// `log_dir/log_file`, non-ANSI in the file sink. Mirrors this codebase's
/// `server_main` logging setup, generalized to take an explicit
/// destination rather than reading hardcoded defaults.
pub fn init(log_dir: &Path, log_file: &str) -> LoggingGuards {
    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    let _ = registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .try_init();
    LoggingGuards { _file_guard: file_guard, _stdout_guard: stdout_guard }
}

/// The log destination before a Session exists (§7 item 1: "to a central
/// `error_log.log` before a Session exists"). Resolved once at startup
/// from `Config::data_directory`.
pub fn central_error_log_path(data_directory: &Path) -> PathBuf {
    data_directory.join("error_log.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_central_error_log_path_is_under_data_directory() {
        let path = central_error_log_path(Path::new("/data"));
        assert_eq!(path, PathBuf::from("/data/error_log.log"));
    }
}
