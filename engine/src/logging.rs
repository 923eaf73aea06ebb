use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. The filter comes from `RUST_LOG`
/// and defaults to `info`. Safe to call more than once; later calls are
/// no-ops.
pub fn init(json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	if json {
		tracing_subscriber::fmt().json().with_env_filter(filter).try_init().ok();
	} else {
		tracing_subscriber::fmt().with_env_filter(filter).try_init().ok();
	}
}
