//! Subscriber installation for binaries built on volley.
//!
//! The library itself only emits `tracing` events; nothing is printed until a binary
//! installs a subscriber, for instance with [`init`].
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*, util::TryInitError, Layer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one event per line.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
    /// Bare messages without timestamp, level or target.
    Raw,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "raw" => Ok(Self::Raw),
            other => Err(format!("unknown log format `{other}`, expected text, json or raw")),
        }
    }
}

/// Installs a global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise everything at `info` and above is shown, or
/// `debug` and above when `verbose` is set. Fails if a global subscriber is already
/// installed.
pub fn init(format: LogFormat, verbose: bool) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });

    let layer = match format {
        LogFormat::Text => fmt::layer().compact().with_target(false).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
        LogFormat::Raw => fmt::layer()
            .without_time()
            .with_level(false)
            .with_target(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
}
