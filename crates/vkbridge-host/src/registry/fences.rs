use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, trace, warn};

use super::entries::{ChildEntry, FenceEntry};
use super::Registry;
use crate::driver::{DispatchTable, FenceCreateInfo, HostHandle, SemaphoreCreateInfo, SubmitInfo};
use crate::error::{fatal, HostError, HostResult};
use crate::handle::{BoxedHandle, HandleKind};
use crate::sync::HostFenceWaiter;

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

impl Registry {
    /// Create a fence. Exportable fences come from the device's pool when one has signaled.
    pub fn create_fence(&self, device: BoxedHandle, info: &FenceCreateInfo) -> HostResult<BoxedHandle> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let mut state = self.lock();
        let pooled = if info.exportable {
            match state.devices.get(&host_device) {
                Some(entry) => entry.fence_pool.pop(info),
                None => return Err(Self::stale(device, HandleKind::Device)),
            }
        } else {
            None
        };
        let fence = match pooled {
            Some(fence) => fence,
            None => dispatch.driver().create_fence(host_device, info)?,
        };
        let boxed = self.box_child(HandleKind::Fence, fence, &dispatch);
        state.fences.insert(
            fence,
            FenceEntry {
                boxed,
                device: host_device,
                exportable: info.exportable,
            },
        );
        Ok(boxed)
    }

    /// Destroy a fence. Exportable fences go back to the device's pool instead.
    pub fn destroy_fence(&self, device: BoxedHandle, fence: BoxedHandle) -> HostResult<()> {
        if fence.is_null() {
            return Ok(());
        }
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host = self.resolve(fence, HandleKind::Fence)?;
        let mut state = self.lock();
        let Some(entry) = state.fences.get(&host) else {
            return Err(Self::stale(fence, HandleKind::Fence));
        };
        if entry.device != host_device {
            return Err(HostError::InvalidArgument("object belongs to a different device"));
        }
        let exportable = entry.exportable;
        if let Some(entry) = state.fences.remove(&host) {
            self.unbox_removed(entry.boxed);
        }
        if exportable {
            match state.devices.get(&host_device) {
                Some(device_entry) => device_entry.fence_pool.add(host),
                None => return Err(Self::stale(device, HandleKind::Device)),
            }
        } else {
            dispatch.driver().destroy_fence(host_device, host);
        }
        Ok(())
    }

    pub fn reset_fences(&self, device: BoxedHandle, fences: &[BoxedHandle]) -> HostResult<()> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let hosts = fences
            .iter()
            .map(|&f| self.resolve(f, HandleKind::Fence))
            .collect::<HostResult<Vec<_>>>()?;
        dispatch.driver().reset_fences(host_device, &hosts)?;
        Ok(())
    }

    pub fn get_fence_status(&self, device: BoxedHandle, fence: BoxedHandle) -> HostResult<vk::Result> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host = self.resolve(fence, HandleKind::Fence)?;
        Ok(dispatch.driver().get_fence_status(host_device, host))
    }

    /// Guest-issued multi-fence wait. Blocks without holding the registry lock.
    pub fn wait_for_fences(
        &self,
        device: BoxedHandle,
        fences: &[BoxedHandle],
        wait_all: bool,
        timeout_ns: u64,
    ) -> HostResult<vk::Result> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let hosts = fences
            .iter()
            .map(|&f| self.resolve(f, HandleKind::Fence))
            .collect::<HostResult<Vec<_>>>()?;
        Ok(dispatch
            .driver()
            .wait_for_fences(host_device, &hosts, wait_all, timeout_ns))
    }

    /// Device and dispatch of a live fence, or `None` once it is gone.
    fn fence_owner(&self, fence: BoxedHandle) -> Option<(HostHandle, HostHandle, Arc<DispatchTable>)> {
        let host = self.handles.unbox_typed(fence, HandleKind::Fence)?;
        let state = self.lock();
        let device = state.fences.get(&host)?.device;
        let dispatch = Arc::clone(&state.devices.get(&device)?.dispatch);
        Some((device, host, dispatch))
    }

    pub fn create_semaphore(&self, device: BoxedHandle, info: &SemaphoreCreateInfo) -> HostResult<BoxedHandle> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let mut state = self.lock();
        let semaphore = dispatch.driver().create_semaphore(host_device, info)?;
        let boxed = self.box_child(HandleKind::Semaphore, semaphore, &dispatch);
        state.semaphores.insert(
            semaphore,
            ChildEntry {
                boxed,
                device: host_device,
            },
        );
        Ok(boxed)
    }

    /// Destroy a semaphore.
    ///
    /// A semaphore may still be named by a submission in flight on another thread, so its handle
    /// stays resolvable until the device's next cleanup pass, which also destroys the host
    /// object.
    pub fn destroy_semaphore(&self, device: BoxedHandle, semaphore: BoxedHandle) -> HostResult<()> {
        if semaphore.is_null() {
            return Ok(());
        }
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host = self.resolve(semaphore, HandleKind::Semaphore)?;
        let mut state = self.lock();
        let owner = match state.semaphores.get(&host) {
            Some(entry) => entry.device,
            None => return Err(Self::stale(semaphore, HandleKind::Semaphore)),
        };
        if owner != host_device {
            return Err(HostError::InvalidArgument("object belongs to a different device"));
        }
        state.semaphores.remove(&host);
        self.handles.remove_delayed(
            semaphore,
            device,
            Some(Box::new(move || {
                dispatch.driver().destroy_semaphore(host_device, host);
            })),
        );
        Ok(())
    }

    /// Submit an empty batch that waits on `wait_semaphores` and signals a fresh fence recorded
    /// against `image`. [`Registry::wait_qsri`] waits on these fences in submission order.
    pub fn queue_signal_release_image(
        &self,
        queue: BoxedHandle,
        image: BoxedHandle,
        wait_semaphores: &[BoxedHandle],
    ) -> HostResult<()> {
        let queue_record = self.resolve_record(queue, HandleKind::Queue)?;
        let host_queue = queue_record.object();
        let host_image = self.resolve(image, HandleKind::Image)?;
        let waits = wait_semaphores
            .iter()
            .map(|&s| self.resolve(s, HandleKind::Semaphore))
            .collect::<HostResult<Vec<_>>>()?;

        let (device, submit_lock, fence) = {
            let mut state = self.lock();
            let Some(queue_entry) = state.queues.get(&host_queue) else {
                return Err(Self::stale(queue, HandleKind::Queue));
            };
            let device = queue_entry.device;
            let submit_lock = Arc::clone(&queue_entry.submit_lock);
            let Some(device_entry) = state.devices.get(&device) else {
                fatal!(?queue, "queue without a device entry");
            };
            let info = FenceCreateInfo::default();
            let fence = match device_entry.fence_pool.pop(&info) {
                Some(fence) => fence,
                None => device_entry.dispatch.driver().create_fence(device, &info)?,
            };
            match state.images.get_mut(&host_image) {
                Some(entry) if entry.device == device => entry.qsri_fences.push_back(fence),
                Some(_) => {
                    queue_record.dispatch().driver().destroy_fence(device, fence);
                    return Err(HostError::InvalidArgument("object belongs to a different device"));
                }
                None => return Err(Self::stale(image, HandleKind::Image)),
            }
            (device, submit_lock, fence)
        };

        let submit = SubmitInfo {
            wait_semaphores: waits,
            ..SubmitInfo::default()
        };
        let _guard = submit_lock.lock();
        trace!(?queue, ?image, ?fence, "presentation release submitted");
        queue_record
            .dispatch()
            .driver()
            .queue_submit(host_queue, &[submit], fence)
            .map_err(|err| {
                warn!(?device, ?err, "presentation release submission failed");
                HostError::from(err)
            })
    }

    /// Wait for the oldest outstanding presentation release on `image`, then recycle its fence.
    ///
    /// Returns `SUCCESS` if the image is gone or has nothing outstanding.
    pub fn wait_qsri(&self, image: BoxedHandle, timeout: Duration) -> vk::Result {
        let Some(host_image) = self.handles.unbox_typed(image, HandleKind::Image) else {
            return vk::Result::SUCCESS;
        };
        let (device, fence, dispatch) = {
            let state = self.lock();
            let Some(entry) = state.images.get(&host_image) else {
                return vk::Result::SUCCESS;
            };
            let Some(&fence) = entry.qsri_fences.front() else {
                return vk::Result::SUCCESS;
            };
            let Some(device_entry) = state.devices.get(&entry.device) else {
                return vk::Result::SUCCESS;
            };
            (entry.device, fence, Arc::clone(&device_entry.dispatch))
        };

        let result = dispatch
            .driver()
            .wait_for_fences(device, &[fence], true, timeout_ns(timeout));
        if result != vk::Result::SUCCESS {
            return result;
        }

        let mut state = self.lock();
        let recycled = state
            .images
            .get_mut(&host_image)
            .filter(|entry| entry.qsri_fences.front() == Some(&fence))
            .and_then(|entry| entry.qsri_fences.pop_front());
        if let Some(fence) = recycled {
            if let Some(device_entry) = state.devices.get(&device) {
                device_entry.fence_pool.add(fence);
            }
        }
        result
    }
}

impl HostFenceWaiter for Registry {
    /// Wait for a registry fence without holding the registry lock. A fence destroyed before
    /// or during the wait counts as signaled.
    fn wait_for_fence(&self, fence: BoxedHandle, timeout: Duration) -> vk::Result {
        let Some((device, host, dispatch)) = self.fence_owner(fence) else {
            debug!(?fence, "waiting on a fence that no longer exists");
            return vk::Result::SUCCESS;
        };
        match dispatch
            .driver()
            .wait_for_fences(device, &[host], true, timeout_ns(timeout))
        {
            vk::Result::ERROR_UNKNOWN if self.handles.unbox(fence).is_none() => vk::Result::SUCCESS,
            result => result,
        }
    }

    fn wait_qsri(&self, image: BoxedHandle, timeout: Duration) -> vk::Result {
        Registry::wait_qsri(self, image, timeout)
    }
}
