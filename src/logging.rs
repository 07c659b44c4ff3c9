//! Tracing setup for the binary and for embedders that want the same
//! defaults.

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Installs a global `fmt` subscriber writing to stderr.  `RUST_LOG`
/// overrides the default `vat_engine=info` filter.  Safe to call more
/// than once; only the first call has an effect.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("vat_engine=info"));

        // Another subscriber may already be installed by an embedder.
        let _ = fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
