//! Diagnostic logging to standard error.
//!
//! Standard output belongs to the operator (prompts and the connection
//! banner), so log events always go to standard error. `JSOM_LOG` takes an
//! `EnvFilter` directive and overrides the level chosen by `--debug`.

use std::env;
use std::io;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding a filter directive.
pub const LOG_ENV: &str = "JSOM_LOG";

/// Installs the global subscriber. A second call leaves the first in place.
pub fn init(debug: bool) {
    tracing_subscriber::registry()
        .with(build_filter(env::var(LOG_ENV).ok().as_deref(), debug))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .try_init()
        .ok();
}

fn build_filter(directive: Option<&str>, debug: bool) -> EnvFilter {
    let fallback = if debug { "debug" } else { "info" };
    directive
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback))
}
