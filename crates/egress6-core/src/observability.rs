//! Observability: tracing initialisation.
//!
//! Uses [`crate::config::ObservabilityConfig`] for EGRESS6_QUIET, EGRESS6_LOG_LEVEL
//! and EGRESS6_LOG_JSON. `RUST_LOG`, when set, overrides all of them.

use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::ObservabilityConfig;

/// Filter directive derived from config, before `RUST_LOG` is considered.
pub fn default_directive(cfg: &ObservabilityConfig) -> String {
    if cfg.quiet {
        "egress6=warn,egress6_proxy=warn".to_string()
    } else {
        cfg.log_level.clone()
    }
}

/// Initialize tracing. Call once at process startup; later calls are no-ops.
pub fn init_tracing() {
    let cfg = ObservabilityConfig::from_env();
    let level = default_directive(cfg);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let _ = if cfg.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    };
}
