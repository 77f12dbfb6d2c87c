use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber: `RUST_LOG`-style filtering,
/// defaulting to `info`, with a terse format. Safe to call more than once.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
