use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Initialize tracing with JSON output for cluster log collection.
/// The `LOG` environment variable carries the filter directives.
pub async fn init() {
    let logger = tracing_subscriber::fmt::layer().json();
    let env_filter = EnvFilter::try_from_env("LOG")
        .or(EnvFilter::try_new("info"))
        .unwrap();

    let reg = Registry::default();
    reg.with(env_filter).with(logger).init();
}
