//! provides logging helpers

use std::io::IsTerminal;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// Logs go to stderr at `default_level`; `RUST_LOG` directives take
/// precedence. Colors are only used when stderr is a terminal, so container
/// logs stay plain text.
pub fn init(default_level: LevelFilter) {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_filter(env_filter(default_level, directives.as_deref()));

    registry().with(fmt_layer).init();
}

fn env_filter(default_level: LevelFilter, directives: Option<&str>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .parse_lossy(directives.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_applies_without_directives() {
        let filter = env_filter(LevelFilter::DEBUG, None).to_string();

        assert!(filter.to_lowercase().contains("debug"));
    }

    #[test]
    fn directives_are_kept_next_to_the_default_level() {
        let filter = env_filter(LevelFilter::INFO, Some("h2=warn")).to_string();

        assert!(filter.contains("h2=warn"));
    }
}
