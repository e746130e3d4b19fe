use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the host layer.
///
/// Every field has a default, so a JSON config only needs to name what it overrides:
///
/// ```
/// let cfg = vkbridge_host::HostConfig::from_json_str(r#"{ "sync_worker_count": 2 }"#).unwrap();
/// assert_eq!(cfg.sync_worker_count, 2);
/// assert_eq!(cfg.host_sync_timeout(), std::time::Duration::from_secs(5));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Slots in the handle table's fixed fast path; later handles spill into an ordered map.
    pub handle_table_capacity: usize,
    /// Pooled scratch buffers kept around for reuse.
    pub scratch_pool_limit: usize,

    /// How often a thread parked on an order ledger re-checks the counter.
    pub host_sync_wake_interval_ms: u64,
    /// Overall limit after which an out-of-order unit proceeds anyway.
    pub host_sync_timeout_ms: u64,

    /// Limit for a single sync-worker fence wait. The guest timeline advances after it expires.
    pub fence_wait_timeout_ms: u64,
    pub sync_worker_count: usize,
    /// Fire timeline fences inline from task completion instead of from `poll()`.
    pub async_fence_callback: bool,

    pub enable_etc2_emulation: bool,
    pub enable_astc_emulation: bool,

    /// Largest linear buffer a stream resource may ask for.
    pub max_resource_bytes: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            handle_table_capacity: 1 << 16,
            scratch_pool_limit: 64,
            host_sync_wake_interval_ms: 10,
            host_sync_timeout_ms: 5_000,
            fence_wait_timeout_ms: 5_000,
            sync_worker_count: 4,
            async_fence_callback: true,
            enable_etc2_emulation: true,
            enable_astc_emulation: true,
            max_resource_bytes: 512 << 20,
        }
    }
}

impl HostConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn host_sync_wake_interval(&self) -> Duration {
        Duration::from_millis(self.host_sync_wake_interval_ms.max(1))
    }

    pub fn host_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.host_sync_timeout_ms)
    }

    pub fn fence_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_wait_timeout_ms)
    }

    pub fn with_handle_table_capacity(mut self, capacity: usize) -> Self {
        self.handle_table_capacity = capacity;
        self
    }

    pub fn with_host_sync_timeout(mut self, timeout: Duration) -> Self {
        self.host_sync_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_fence_wait_timeout(mut self, timeout: Duration) -> Self {
        self.fence_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_sync_worker_count(mut self, count: usize) -> Self {
        self.sync_worker_count = count;
        self
    }

    pub fn with_async_fence_callback(mut self, enabled: bool) -> Self {
        self.async_fence_callback = enabled;
        self
    }

    pub fn with_compressed_emulation(mut self, etc2: bool, astc: bool) -> Self {
        self.enable_etc2_emulation = etc2;
        self.enable_astc_emulation = astc;
        self
    }

    pub fn with_max_resource_bytes(mut self, limit: u64) -> Self {
        self.max_resource_bytes = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = HostConfig::from_json_str(r#"{ "enable_astc_emulation": false }"#).unwrap();
        assert!(!cfg.enable_astc_emulation);
        assert!(cfg.enable_etc2_emulation);
        assert_eq!(cfg.sync_worker_count, HostConfig::default().sync_worker_count);
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(HostConfig::from_json_str(r#"{ "sync_worker_count": "four" }"#).is_err());
    }
}
