//! Tracing subscriber setup for the `ctree` binary.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "context_tree=info,ctree=info";

/// Install a stderr subscriber. `RUST_LOG` overrides the default filter;
/// `verbose` raises the default to debug.
pub fn init_logging(verbose: bool) {
    let default = if verbose {
        "context_tree=debug,ctree=debug"
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (tests, embedding hosts) keeps the existing subscriber.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .try_init();
}
