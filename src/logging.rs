use std::env;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Filter directives: `PREBAKE_LOG`, else `RUST_LOG`, else `info`.
fn filter_directives(prebake_log: Option<String>, rust_log: Option<String>) -> String {
    prebake_log
        .or(rust_log)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| Level::INFO.to_string().to_ascii_lowercase())
}

/// Installs the stderr subscriber. Safe to call more than once.
pub fn init() {
    let directives = filter_directives(env::var("PREBAKE_LOG").ok(), env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
