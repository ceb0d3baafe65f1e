//! Control plane logging setup.

use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Directives used when `RUST_LOG` is unset. sqlx logs every statement at info.
pub const DEFAULT_FILTER: &str = "ztna_apiserver=info,ztna_core=info,sqlx=warn,h2=warn";

/// Parse `rust_log` into a filter, falling back to `default_filter` when it
/// is unset, blank, or invalid. The parse error is handed back so it can be
/// logged once a subscriber is installed.
pub fn build_filter(rust_log: Option<&str>, default_filter: &str) -> (EnvFilter, Option<ParseError>) {
    match rust_log.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directives) => match EnvFilter::try_new(directives) {
            Ok(filter) => (filter, None),
            Err(e) => (EnvFilter::new(default_filter), Some(e)),
        },
        None => (EnvFilter::new(default_filter), None),
    }
}

/// Install the global subscriber.
///
/// JSON output carries the current span's fields, so every line logged
/// inside an RPC handler includes its `rpc` name. Fails if a subscriber is
/// already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<(), TryInitError> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let (filter, invalid) = build_filter(rust_log.as_deref(), default_filter);

    let registry = tracing_subscriber::registry().with(filter);
    if log_json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init()?;
    } else {
        registry.with(fmt::layer()).try_init()?;
    }

    if let Some(e) = invalid {
        tracing::warn!(error = %e, default = default_filter, "Ignoring invalid RUST_LOG");
    }
    Ok(())
}
