use std::fmt;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::driver::{DispatchTable, FenceCreateInfo, HostHandle};
use crate::error::fatal;

/// Exportable fences a device has destroyed on the guest side, kept for reuse.
///
/// An exported fence may still be referenced by a sync file the guest holds, so it is only
/// handed out again once the host reports it signaled.
pub struct ExternalFencePool {
    dispatch: Arc<DispatchTable>,
    device: HostHandle,
    fences: Mutex<Vec<HostHandle>>,
}

impl fmt::Debug for ExternalFencePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalFencePool")
            .field("device", &self.device)
            .field("pooled", &self.len())
            .finish()
    }
}

impl ExternalFencePool {
    pub fn new(dispatch: Arc<DispatchTable>, device: HostHandle) -> Self {
        Self {
            dispatch,
            device,
            fences: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, fence: HostHandle) {
        debug!(device = ?self.device, ?fence, "external fence returned to pool");
        self.fences.lock().push(fence);
    }

    /// Take a signaled fence out of the pool, reset unless `info` asks for a signaled fence.
    pub fn pop(&self, info: &FenceCreateInfo) -> Option<HostHandle> {
        let driver = self.dispatch.driver();
        let fence = {
            let mut fences = self.fences.lock();
            let pos = fences
                .iter()
                .position(|&f| driver.get_fence_status(self.device, f) == vk::Result::SUCCESS)?;
            fences.swap_remove(pos)
        };

        if !info.flags.contains(vk::FenceCreateFlags::SIGNALED) {
            if let Err(err) = driver.reset_fences(self.device, &[fence]) {
                warn!(device = ?self.device, ?fence, ?err, "failed to reset pooled fence");
                driver.destroy_fence(self.device, fence);
                return None;
            }
        }
        debug!(device = ?self.device, ?fence, "reusing pooled external fence");
        Some(fence)
    }

    /// Drain the pool. The caller destroys what it gets back.
    pub fn pop_all(&self) -> Vec<HostHandle> {
        std::mem::take(&mut *self.fences.lock())
    }

    pub fn len(&self) -> usize {
        self.fences.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ExternalFencePool {
    fn drop(&mut self) {
        let remaining = self.fences.get_mut().len();
        if remaining != 0 {
            fatal!(
                device = ?self.device,
                remaining,
                "external fence pool destroyed with fences still alive"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DispatchLevel, DriverCall, HostDriver, SoftHostDriver};

    const DEVICE: HostHandle = HostHandle(0x2222_0000);

    fn pool() -> (Arc<SoftHostDriver>, ExternalFencePool) {
        let driver = Arc::new(SoftHostDriver::new());
        let dispatch = DispatchTable::new(DispatchLevel::Device, Arc::clone(&driver) as Arc<dyn HostDriver>);
        (driver, ExternalFencePool::new(dispatch, DEVICE))
    }

    fn fence(driver: &SoftHostDriver, signaled: bool) -> HostHandle {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        driver
            .create_fence(
                DEVICE,
                &FenceCreateInfo {
                    flags,
                    exportable: true,
                },
            )
            .unwrap()
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let (_driver, pool) = pool();
        assert_eq!(pool.pop(&FenceCreateInfo::default()), None);
    }

    #[test]
    fn signaled_fence_is_reused_and_reset() {
        let (driver, pool) = pool();
        let f = fence(&driver, true);
        pool.add(f);
        driver.clear_calls();

        assert_eq!(pool.pop(&FenceCreateInfo::default()), Some(f));
        assert_eq!(driver.calls(), vec![DriverCall::ResetFences(vec![f])]);
        assert_eq!(driver.get_fence_status(DEVICE, f), vk::Result::NOT_READY);
        driver.destroy_fence(DEVICE, f);
    }

    #[test]
    fn signaled_request_skips_reset() {
        let (driver, pool) = pool();
        let f = fence(&driver, true);
        pool.add(f);
        driver.clear_calls();

        let info = FenceCreateInfo {
            flags: vk::FenceCreateFlags::SIGNALED,
            exportable: true,
        };
        assert_eq!(pool.pop(&info), Some(f));
        assert!(driver.calls().is_empty());
        driver.destroy_fence(DEVICE, f);
    }

    #[test]
    fn pending_fence_stays_pooled() {
        let (driver, pool) = pool();
        let f = fence(&driver, false);
        pool.add(f);
        assert_eq!(pool.pop(&FenceCreateInfo::default()), None);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.pop_all(), vec![f]);
    }

    #[test]
    fn pop_all_drains_everything() {
        let (driver, pool) = pool();
        let fences: Vec<_> = (0..3).map(|_| fence(&driver, false)).collect();
        for &f in &fences {
            pool.add(f);
        }
        let mut drained = pool.pop_all();
        drained.sort();
        assert_eq!(drained, fences);
        assert!(pool.is_empty());
    }
}
