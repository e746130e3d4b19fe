use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::ExternalFencePool;
use crate::driver::{DispatchTable, HostHandle, ImageCreateInfo, SamplerCreateInfo};
use crate::emulation::{CompressedFormat, DeviceEmulation};
use crate::handle::BoxedHandle;

/// Entries owned by a logical device.
pub(super) trait DeviceChild {
    fn device(&self) -> HostHandle;
}

macro_rules! impl_device_child {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl DeviceChild for $ty {
                fn device(&self) -> HostHandle {
                    self.device
                }
            }
        )+
    };
}

pub(super) struct InstanceEntry {
    pub boxed: BoxedHandle,
    pub dispatch: Arc<DispatchTable>,
    pub physical_devices: Vec<HostHandle>,
}

pub(super) struct PhysicalDeviceEntry {
    pub boxed: BoxedHandle,
    pub instance: HostHandle,
    pub emulation: DeviceEmulation,
}

pub(super) struct DeviceEntry {
    pub boxed: BoxedHandle,
    pub instance: HostHandle,
    pub dispatch: Arc<DispatchTable>,
    pub emulation: DeviceEmulation,
    /// Queue family index to the queues created in it, by queue index.
    pub queues: HashMap<u32, Vec<HostHandle>>,
    pub fence_pool: Arc<ExternalFencePool>,
}

pub(super) struct QueueEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    pub family_index: u32,
    /// Held for the duration of every host submission to this queue.
    pub submit_lock: Arc<Mutex<()>>,
}

pub(super) struct MemoryEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    pub size: u64,
    /// Persistent host mapping of a host-visible allocation.
    pub host_address: Option<u64>,
    pub guest_physical: Option<u64>,
}

pub(super) struct BufferEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    pub size: u64,
    pub binding: Option<(HostHandle, u64)>,
}

/// Host-side backing of an image whose compressed format is emulated.
pub(super) struct EmulatedImage {
    pub format: &'static CompressedFormat,
    pub shadow: HostHandle,
    pub shadow_memory: HostHandle,
    /// Upload buffer and its memory, laid out like the shadow image. Created on the first
    /// decompressed upload and released with the image.
    pub staging: Option<(HostHandle, HostHandle)>,
}

pub(super) struct ImageEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    /// Creation info as the guest gave it; copy regions are checked against it.
    pub info: ImageCreateInfo,
    pub emulated: Option<EmulatedImage>,
    /// Presentation-release fences, oldest first.
    pub qsri_fences: VecDeque<HostHandle>,
}

pub(super) struct ImageViewEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    pub needs_emulated_alpha: bool,
}

pub(super) struct SamplerEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    pub info: SamplerCreateInfo,
    /// Same sampler with an opaque border, for views whose alpha is synthesized.
    pub emulated_alpha_twin: Option<HostHandle>,
}

pub(super) struct FenceEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    pub exportable: bool,
}

pub(super) struct DescriptorPoolEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    pub sets: Vec<HostHandle>,
}

pub(super) struct DescriptorSetEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    pub pool: HostHandle,
}

pub(super) struct CommandPoolEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    pub buffers: Vec<HostHandle>,
}

pub(super) struct CommandBufferEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
    pub pool: HostHandle,
}

/// Entry for categories with no state beyond ownership.
pub(super) struct ChildEntry {
    pub boxed: BoxedHandle,
    pub device: HostHandle,
}

impl_device_child!(
    QueueEntry,
    MemoryEntry,
    BufferEntry,
    ImageEntry,
    ImageViewEntry,
    SamplerEntry,
    FenceEntry,
    DescriptorPoolEntry,
    DescriptorSetEntry,
    CommandPoolEntry,
    CommandBufferEntry,
    ChildEntry,
);

/// Guest-physical window backed by a host-visible allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct GuestPhysicalMapping {
    pub size: u64,
    pub memory: HostHandle,
}

#[derive(Default)]
pub(super) struct RegistryState {
    pub instances: HashMap<HostHandle, InstanceEntry>,
    pub physical_devices: HashMap<HostHandle, PhysicalDeviceEntry>,
    pub devices: HashMap<HostHandle, DeviceEntry>,
    pub queues: HashMap<HostHandle, QueueEntry>,
    pub memories: HashMap<HostHandle, MemoryEntry>,
    pub buffers: HashMap<HostHandle, BufferEntry>,
    pub images: HashMap<HostHandle, ImageEntry>,
    pub image_views: HashMap<HostHandle, ImageViewEntry>,
    pub samplers: HashMap<HostHandle, SamplerEntry>,
    pub semaphores: HashMap<HostHandle, ChildEntry>,
    pub fences: HashMap<HostHandle, FenceEntry>,
    pub descriptor_set_layouts: HashMap<HostHandle, ChildEntry>,
    pub descriptor_pools: HashMap<HostHandle, DescriptorPoolEntry>,
    pub descriptor_sets: HashMap<HostHandle, DescriptorSetEntry>,
    pub shader_modules: HashMap<HostHandle, ChildEntry>,
    pub pipeline_caches: HashMap<HostHandle, ChildEntry>,
    pub pipelines: HashMap<HostHandle, ChildEntry>,
    pub render_passes: HashMap<HostHandle, ChildEntry>,
    pub framebuffers: HashMap<HostHandle, ChildEntry>,
    pub command_pools: HashMap<HostHandle, CommandPoolEntry>,
    pub command_buffers: HashMap<HostHandle, CommandBufferEntry>,
    /// Keyed by guest-physical base address. Ranges never overlap.
    pub guest_physical: BTreeMap<u64, GuestPhysicalMapping>,
}

/// Remove and return every entry of `map` owned by `device`, in host handle order.
pub(super) fn drain_device_children<E: DeviceChild>(
    map: &mut HashMap<HostHandle, E>,
    device: HostHandle,
) -> Vec<(HostHandle, E)> {
    let mut owned: Vec<HostHandle> = map
        .iter()
        .filter(|(_, entry)| entry.device() == device)
        .map(|(&object, _)| object)
        .collect();
    owned.sort_unstable();
    owned
        .into_iter()
        .filter_map(|object| map.remove(&object).map(|entry| (object, entry)))
        .collect()
}
