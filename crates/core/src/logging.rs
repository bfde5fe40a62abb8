//! Logging setup for hosts that embed adapted layers.
//!
//! The engine only emits `tracing` events; a training loop calls one of the
//! `try_init*` functions once to see them.
//!
//! Set `CL_LORA_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels (default: info), e.g.
//! `RUST_LOG=cl_lora_core=debug` to see merge transitions.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FORMAT_ENV: &str = "CL_LORA_LOG_FORMAT";

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs.
    Json,
}

impl LogFormat {
    /// Detect log format from environment.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Install a global subscriber using `RUST_LOG` and the format from the
/// environment. Returns `false` if one is already installed.
pub fn try_init() -> bool {
    try_init_with_level_and_format(None, LogFormat::from_env())
}

/// Like [`try_init`] with a fallback level used when `RUST_LOG` is unset.
pub fn try_init_with_level(level: &str) -> bool {
    try_init_with_level_and_format(Some(level), LogFormat::from_env())
}

pub fn try_init_with_level_and_format(level: Option<&str>, format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
    result.is_ok()
}
