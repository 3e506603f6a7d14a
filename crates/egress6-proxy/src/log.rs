//! Quiet-mode aware logging. When EGRESS6_QUIET=1, per-request [INFO] lines are
//! suppressed. Uses `tracing::info!` so output goes through the subscriber.

#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {{
        if !$crate::log::is_quiet() {
            tracing::info!($($arg)*);
        }
    }};
}

pub fn is_quiet() -> bool {
    egress6_core::config::ObservabilityConfig::from_env().quiet
}
