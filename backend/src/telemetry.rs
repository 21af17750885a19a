//! Telemetry initialization: tracing subscriber writing to stderr.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to this
//! crate and sqlx query logging stays at warn.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directives for a log level.
pub fn default_directives(level: &str) -> String {
    format!("dump_keeper_backend={},dump_keeper={},sqlx::query=warn", level, level)
}

/// Initialize the tracing subscriber.
pub fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    // Output stays on stderr so `--format json` on stdout remains parseable.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
