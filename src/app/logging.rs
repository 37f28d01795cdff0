use tracing_subscriber::EnvFilter;

pub const DEFAULT_DIRECTIVE: &str = "info";

fn build_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Installs the global subscriber on stderr, leaving stdout to the tagged progress lines.
/// `RUST_LOG` wins over `fallback`.
pub fn init_logging(fallback: &str) {
    let env_filter = build_filter(fallback);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if cfg!(debug_assertions) {
        let _ = builder.try_init();
    } else {
        let _ = builder.json().try_init();
    }
}
