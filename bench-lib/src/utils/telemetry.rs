use std::{io::IsTerminal as _, path::PathBuf};

use rama::{
    error::{BoxError, ErrorContext as _},
    telemetry::tracing,
};
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt::writer::BoxMakeWriter};

#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Debug instead of info as default level.
    pub verbose: bool,
    /// Multi-line, human oriented log format.
    pub pretty: bool,
    /// Append logs to this file instead of writing them to stderr.
    pub output: Option<PathBuf>,
}

impl TelemetryConfig {
    /// Level used when `RUST_LOG` is not set.
    pub fn default_level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        }
    }

    /// Filter from the `RUST_LOG` value in `env`, if any.
    ///
    /// Without it, rama internals only log warnings unless verbose,
    /// so per connection chatter stays out of benchmark runs.
    pub fn env_filter(&self, env: Option<&str>) -> EnvFilter {
        let level = self.default_level();
        let builder = EnvFilter::builder().with_default_directive(level.into());
        match env {
            Some(directives) if !directives.trim().is_empty() => builder.parse_lossy(directives),
            _ if self.verbose => builder.parse_lossy(level.to_string()),
            _ => builder.parse_lossy(format!("{level},rama=warn")),
        }
    }
}

/// Configures structured logging with runtime control via `RUST_LOG` environment variable.
pub fn init_tracing(cfg: &TelemetryConfig) -> Result<(), BoxError> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    let make_writer = match cfg.output.as_deref() {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .context("open log file")
                .with_context_debug_field("path", || path.to_owned())?;

            BoxMakeWriter::new(file)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_ansi(cfg.output.is_none() && std::io::stderr().is_terminal())
        .with_env_filter(cfg.env_filter(env.as_deref()))
        .with_writer(make_writer);

    if cfg.pretty {
        subscriber.pretty().try_init()?;
    } else {
        subscriber.try_init()?;
    }

    tracing::info!(level = %cfg.default_level(), rust_log = ?env, "Tracing is set up");
    Ok(())
}
