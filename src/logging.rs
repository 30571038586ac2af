//! Log output setup for binaries and tests embedding the sync core.
//!
//! The library itself only emits `tracing` events. Call [`init`] once at
//! startup to print them; `RUST_LOG` overrides the default filter.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "taskscope=info";

/// Installs a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_FILTER`].
///
/// Returns `false` if a global subscriber was already installed.
pub fn init() -> bool {
    init_with(DEFAULT_FILTER)
}

/// Like [`init`] with a custom fallback filter.
pub fn init_with(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_existing_subscriber() {
        let _ = init_with("taskscope=debug");
        assert!(!init());
    }
}
