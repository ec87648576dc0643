//! # Structured Logging
//!
//! One `tracing` subscriber for the whole process: an `EnvFilter` followed
//! by a single formatting layer. Everything goes to stderr; the `sweep`
//! subcommand prints its report on stdout.

use std::io::IsTerminal;

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Log output format, chosen with `--log-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-field output with file and line. The default.
    Pretty,
    /// One short line per event.
    Compact,
    /// JSON lines, event fields flattened into the top-level object.
    Json,
}

impl LogFormat {
    /// Unknown names fall back to [`LogFormat::Pretty`].
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer(format: LogFormat) -> BoxedLayer {
    let ansi = std::io::stderr().is_terminal();
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(ansi)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_ansi(ansi)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .flatten_event(true)
            .with_current_span(false)
            .boxed(),
    }
}

/// `RUST_LOG` wins over `--log-level`. A malformed `--log-level` degrades to
/// `info` rather than aborting startup.
fn level_filter(directives: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::try_new(directives).unwrap_or_else(|err| {
        eprintln!("ignoring log level {:?}: {}", directives, err);
        EnvFilter::new("info")
    })
}

/// Installs the global subscriber. Fails if one is already installed.
///
/// ```text
/// RUST_LOG=escrow_node=debug,escrow_engine=debug,tower_http=info
/// ```
pub fn init_logging(directives: &str, format: LogFormat) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(output_layer(format))
        .with(level_filter(directives))
        .try_init()?;

    tracing::debug!(?format, directives, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_is_lenient() {
        assert_eq!(LogFormat::from_str_lossy(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::from_str_lossy("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::from_str_lossy("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str_lossy("xml"), LogFormat::Pretty);
    }

    #[test]
    fn every_format_builds_a_layer() {
        for format in [LogFormat::Pretty, LogFormat::Compact, LogFormat::Json] {
            let _layer = output_layer(format);
        }
    }
}
