// Logging setup
//
// Library crates only emit `tracing` events; binaries and tests choose where
// they go by calling `init` once. `MARTEN_LOG` takes precedence over the
// level passed in and accepts full filter directives
// (`MARTEN_LOG=marten_data=debug,info`).

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LOG_ENV;

/// Install a fmt subscriber filtered by `MARTEN_LOG` or `level`.
///
/// Returns false when a global subscriber was already set, which leaves the
/// existing one in place.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .is_ok()
}
