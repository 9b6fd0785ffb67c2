//! Tracing subscriber setup

use std::io::{self, IsTerminal};

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::{LookupSpan, Registry};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `config.level`. Fails instead of panicking when a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("invalid log filter '{}': {}", config.level, e)))?;

    let result = if config.json {
        let layer = json_layer::<Registry, _>(io::stderr).with_filter(env_filter);
        tracing_subscriber::registry().with(layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(io::stderr().is_terminal())
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    result.map_err(|e| Error::config(format!("logging already initialised: {}", e)))
}

/// One JSON object per event, with the enclosing spans
fn json_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(writer)
}
