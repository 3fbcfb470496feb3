use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Logs go to stderr; stdout is reserved for
/// the progress protocol the orchestrator parses.
pub fn init() {
    let fallback = if std::env::var_os("LBC_DEBUG").is_some() {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
