//! Device provider configuration

use std::env;
use std::str::FromStr;

/// Environment variable selecting the device ordinal.
pub const ENV_DEVICE_ID: &str = "MERIDIAN_DEVICE_ID";
/// Environment variable capping idle device contexts.
pub const ENV_MAX_IDLE_CONTEXTS: &str = "MERIDIAN_MAX_IDLE_CONTEXTS";
/// Environment variable capping idle per-run device allocators.
pub const ENV_MAX_IDLE_ALLOCATORS: &str = "MERIDIAN_MAX_IDLE_ALLOCATORS";
/// Environment variable limiting device memory of a simulated device, in bytes.
pub const ENV_DEVICE_MEMORY_LIMIT: &str = "MERIDIAN_DEVICE_MEMORY_LIMIT";

/// Settings for one [`DeviceExecutionProvider`](crate::DeviceExecutionProvider).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProviderConfig {
    /// Device the provider drives. Must match the device runtime it is given.
    pub device_id: u32,
    /// Idle device contexts kept for reuse.
    pub max_idle_contexts: usize,
    /// Idle default-memory allocators kept for reuse.
    pub max_idle_allocators: usize,
    /// Memory cap applied when the provider builds its own simulated device.
    pub device_memory_limit: Option<usize>,
}

impl Default for DeviceProviderConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            max_idle_contexts: 8,
            max_idle_allocators: 8,
            device_memory_limit: None,
        }
    }
}

impl DeviceProviderConfig {
    /// Defaults overridden by the `MERIDIAN_*` variables. Values that do not
    /// parse are ignored with a warning.
    ///
    /// # Environment Variables
    ///
    /// - `MERIDIAN_DEVICE_ID`
    /// - `MERIDIAN_MAX_IDLE_CONTEXTS`
    /// - `MERIDIAN_MAX_IDLE_ALLOCATORS`
    /// - `MERIDIAN_DEVICE_MEMORY_LIMIT`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(device_id) = parse_env(ENV_DEVICE_ID) {
            config.device_id = device_id;
        }
        if let Some(max) = parse_env(ENV_MAX_IDLE_CONTEXTS) {
            config.max_idle_contexts = max;
        }
        if let Some(max) = parse_env(ENV_MAX_IDLE_ALLOCATORS) {
            config.max_idle_allocators = max;
        }
        if let Some(limit) = parse_env(ENV_DEVICE_MEMORY_LIMIT) {
            config.device_memory_limit = Some(limit);
        }
        config
    }

    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.device_memory_limit = Some(limit);
        self
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "invalid_config_value");
            None
        }
    }
}
