//! Logging setup

use tracing_subscriber::EnvFilter;

use crate::config::BridgeConfig;

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. Returns `false` if a
/// subscriber was already installed (by the host application or an earlier
/// call), in which case nothing changes.
pub fn init_tracing(default_filter: &str) -> bool {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_thread_names(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(version = crate::version(), "RTC bridge logging initialized");
    }
    installed
}

/// [`init_tracing`] with the filter from `config`
pub fn init_from_config(config: &BridgeConfig) -> bool {
    init_tracing(&config.log_filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        let _ = init_tracing("info");
        assert!(!init_tracing("debug"));
    }
}
