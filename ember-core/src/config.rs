/// EMBER Configuration
/// Controls which convolution backend is eligible at runtime

use std::sync::atomic::{AtomicBool, Ordering};

/// Env var that turns the accelerated backend off at load time.
pub const DISABLE_ACCEL_ENV: &str = "EMBER_DISABLE_ACCEL";

/// Global switch for the accelerated (specialized) backend
static USE_ACCELERATED: AtomicBool = AtomicBool::new(true);

/// Check if the accelerated backend may accept tensors
pub fn should_use_accelerated() -> bool {
    USE_ACCELERATED.load(Ordering::Relaxed)
}

/// Enable or disable the accelerated backend (default: enabled when compiled in)
pub fn set_accelerated(enabled: bool) {
    USE_ACCELERATED.store(enabled, Ordering::Relaxed);
    if enabled {
        log::debug!("ember: accelerated convolution backend enabled");
    } else {
        log::debug!("ember: accelerated convolution backend disabled, using im2col fallback");
    }
}

/// Whether the accelerated kernels were compiled into this build.
pub fn is_accelerated_available() -> bool {
    cfg!(feature = "accelerated")
}

/// EMBER runtime settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmberConfig {
    /// Route eligible tensors to the accelerated backend (default: true)
    pub accelerated: bool,
}

impl Default for EmberConfig {
    fn default() -> Self {
        Self { accelerated: true }
    }
}

impl EmberConfig {
    /// Read settings from the environment.
    pub fn from_env() -> Self {
        let disabled = std::env::var(DISABLE_ACCEL_ENV).ok().as_deref() == Some("1");
        Self { accelerated: !disabled }
    }

    /// Apply configuration globally
    pub fn apply(&self) {
        set_accelerated(self.accelerated);
        log::info!(
            "ember configuration applied: accelerated={} (compiled in: {})",
            if self.accelerated { "on" } else { "off" },
            is_accelerated_available()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_enables_acceleration() {
        assert!(EmberConfig::default().accelerated);
    }
}
