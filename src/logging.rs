//! Logging setup
//!
//! The proxy usually shares a terminal with the agent CLI it serves, so
//! stderr output is the default and `--log-file` redirects everything to a
//! file through a non-blocking appender (the returned guard must stay alive
//! for the process lifetime or buffered lines are lost).
//!
//! Precedence: RUST_LOG env var > default "claudish=info".

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Initialize tracing. Returns the appender guard when logging to a file.
pub fn init(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "claudish=info,tower_http=info".into());

    match &config.log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let filename = path.file_name().map(|f| f.to_owned()).unwrap_or_else(|| {
                "claudish.log".into()
            });
            let appender = tracing_appender::rolling::never(directory, filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    }
}
