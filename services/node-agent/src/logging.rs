//! Logging initialization for the agent process.
//!
//! There is no logger state outside the subscriber installed here; library
//! code only emits `tracing` events and spans.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogFormat;

/// Build the level filter. `RUST_LOG` takes priority over `level`.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
pub fn init(format: LogFormat, level: &str) -> anyhow::Result<()> {
    let layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter(level)))
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_directives() {
        if std::env::var_os("RUST_LOG").is_none() {
            let filter = filter("vnode_agent=debug,warn");
            assert!(filter.to_string().contains("vnode_agent=debug"));
        }
    }
}
