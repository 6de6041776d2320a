use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,axum=info,reqwest=warn,hyper=warn";

/// Installs the global subscriber. An explicit `filter` (from the CLI) wins
/// over `RUST_LOG`.
pub fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
