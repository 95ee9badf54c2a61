use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_core::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::TrainError;

/// Installs the global subscriber.
///
/// Records go to stderr and, when `log_file` is given, are appended to that file as well.
/// `RUST_LOG` takes precedence over `level`. Records emitted through the `log` facade are
/// captured too.
pub fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> Result<(), TrainError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let file_layer = match log_file {
        Some(path) => {
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            let name = path
                .file_name()
                .ok_or_else(|| TrainError::Logging(format!("{} is not a file", path.display())))?;
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::NEVER, dir, name);
            Some(
                fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_thread_names(true),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| TrainError::Logging(e.to_string()))?;

    log::debug!("logging initialized at level {level}");
    Ok(())
}
