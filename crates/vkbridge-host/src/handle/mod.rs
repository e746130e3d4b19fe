//! Guest-visible handle identities.
//!
//! A [`BoxedHandle`] never reveals a host pointer. It packs a kind tag, a slot generation and a
//! slot index:
//!
//! ```text
//!  63      56 55                32 31                               0
//! +----------+--------------------+----------------------------------+
//! |   kind   |     generation     |              index               |
//! +----------+--------------------+----------------------------------+
//! ```
//!
//! Generations start at 1, so a live handle is never zero.

mod ledger;
mod scratch;
mod table;

pub use ledger::{HostSyncTiming, LedgerRef, OrderLedger, TurnOutcome};
pub use scratch::{PooledBuffer, ScratchPool};
pub use table::{HandleRecord, HandleTable};

use std::fmt;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandleKind {
    Instance = 1,
    PhysicalDevice = 2,
    Device = 3,
    Queue = 4,
    DeviceMemory = 5,
    Buffer = 6,
    Image = 7,
    ImageView = 8,
    Sampler = 9,
    Semaphore = 10,
    Fence = 11,
    DescriptorSetLayout = 12,
    DescriptorPool = 13,
    DescriptorSet = 14,
    ShaderModule = 15,
    PipelineCache = 16,
    Pipeline = 17,
    RenderPass = 18,
    Framebuffer = 19,
    CommandPool = 20,
    CommandBuffer = 21,
}

impl HandleKind {
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Instance,
            2 => Self::PhysicalDevice,
            3 => Self::Device,
            4 => Self::Queue,
            5 => Self::DeviceMemory,
            6 => Self::Buffer,
            7 => Self::Image,
            8 => Self::ImageView,
            9 => Self::Sampler,
            10 => Self::Semaphore,
            11 => Self::Fence,
            12 => Self::DescriptorSetLayout,
            13 => Self::DescriptorPool,
            14 => Self::DescriptorSet,
            15 => Self::ShaderModule,
            16 => Self::PipelineCache,
            17 => Self::Pipeline,
            18 => Self::RenderPass,
            19 => Self::Framebuffer,
            20 => Self::CommandPool,
            21 => Self::CommandBuffer,
            _ => return None,
        })
    }

    /// Dispatchable objects carry their own dispatch pointer in the native API.
    pub const fn is_dispatchable(self) -> bool {
        matches!(
            self,
            Self::Instance | Self::PhysicalDevice | Self::Device | Self::Queue | Self::CommandBuffer
        )
    }

    /// Whether work submitted through this handle is ordered by a ledger.
    pub const fn is_submission_capable(self) -> bool {
        matches!(self, Self::Queue | Self::CommandBuffer)
    }
}

pub(crate) const GENERATION_BITS: u32 = 24;
pub(crate) const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BoxedHandle(u64);

impl BoxedHandle {
    pub const NULL: Self = Self(0);

    pub(crate) fn new(kind: HandleKind, generation: u32, index: u32) -> Self {
        debug_assert!(generation != 0 && generation <= GENERATION_MASK);
        Self(((kind as u64) << 56) | (u64::from(generation & GENERATION_MASK) << 32) | u64::from(index))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn kind(self) -> Option<HandleKind> {
        HandleKind::from_u8((self.0 >> 56) as u8)
    }

    pub(crate) fn generation(self) -> u32 {
        ((self.0 >> 32) as u32) & GENERATION_MASK
    }

    pub(crate) fn index(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for BoxedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("BoxedHandle(NULL)");
        }
        match self.kind() {
            Some(kind) => write!(
                f,
                "BoxedHandle({kind:?} #{} gen {})",
                self.index(),
                self.generation()
            ),
            None => write!(f, "BoxedHandle(0x{:016x})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_fields_pack_and_unpack() {
        let h = BoxedHandle::new(HandleKind::Fence, 0xab_cdef, 0x1234_5678);
        assert_eq!(h.kind(), Some(HandleKind::Fence));
        assert_eq!(h.generation(), 0xab_cdef);
        assert_eq!(h.index(), 0x1234_5678);
        assert!(!h.is_null());
    }

    #[test]
    fn garbage_kind_tag_is_not_a_kind() {
        assert_eq!(BoxedHandle::from_raw(0xff00_0001_0000_0000).kind(), None);
        assert_eq!(BoxedHandle::NULL.kind(), None);
    }

    #[test]
    fn kind_round_trips_through_tag() {
        for tag in 1..=21u8 {
            let kind = HandleKind::from_u8(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert_eq!(HandleKind::from_u8(22), None);
    }
}
