use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(level: Option<&str>) {
    let fallback = level
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("info")
        .to_lowercase();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_thread_names(true)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_thread_names(true)
            .with_target(false)
            .try_init();
    }
}
