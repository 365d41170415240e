use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Picks the filter directive: `RUST_LOG` first, then the configured level,
/// then [`DEFAULT_FILTER`].
pub fn filter_directive(rust_log: Option<String>, configured: Option<&str>) -> String {
    rust_log
        .filter(|value| !value.trim().is_empty())
        .or_else(|| {
            configured
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Installs the global fmt subscriber. Calling it twice is harmless.
pub fn init(configured: Option<&str>) {
    let directive = filter_directive(std::env::var("RUST_LOG").ok(), configured);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log filter {directive:?} ({err}); using {DEFAULT_FILTER}");
        EnvFilter::new(DEFAULT_FILTER)
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
