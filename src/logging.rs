use tracing_subscriber::EnvFilter;

/// Structured logs go to stderr so stdout stays reserved for reports.
pub fn init() {
    let filter = EnvFilter::try_from_env("DVSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
