use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default directive when `RUST_LOG` is unset: task phases in dev builds, lifecycle only in release.
fn default_directive() -> &'static str {
    if cfg!(debug_assertions) { "info" } else { "warn" }
}

/// Install the global subscriber; logs go to stderr so stdout stays machine-readable.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive()))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_target(false),
        )
        .with(env_filter)
        .try_init();
}
