//! Logging setup, grounded on the teacher's `puffin-cli`/`uv` preference for
//! a `tracing-tree` hierarchical layer over plain `fmt`, with verbosity
//! controlled by `-v`/`RUST_LOG`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

pub fn setup_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let subscriber = Registry::default().with(filter).with(
        tracing_tree::HierarchicalLayer::new(2)
            .with_targets(true)
            .with_bracketed_fields(true),
    );

    if subscriber.try_init().is_err() {
        // A global subscriber is already installed (e.g. in tests); not an
        // error condition worth surfacing to the operator.
    }
}
