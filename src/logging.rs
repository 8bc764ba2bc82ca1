//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured filter when set.

use crate::config::GeneralConfig;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed (e.g. by the host
/// application or a previous call), in which case nothing changes.
pub fn init(config: &GeneralConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = if config.log_format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.is_ok()
}
