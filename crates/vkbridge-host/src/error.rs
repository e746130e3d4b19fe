use ash::vk;
use thiserror::Error;

use crate::handle::{BoxedHandle, HandleKind};

pub type HostResult<T> = std::result::Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    /// Stale, forged, or wrongly-typed guest handle.
    #[error("invalid {expected:?} handle {handle:?}")]
    InvalidHandle {
        handle: BoxedHandle,
        expected: HandleKind,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Error returned by the host driver, forwarded to the guest unchanged.
    #[error("host driver error: {0}")]
    Driver(#[from] vk::Result),

    #[error("format {0:?} is not supported")]
    FormatNotSupported(vk::Format),

    #[error("sync worker has shut down")]
    ShutDown,

    #[error("stream command: {0}")]
    Stream(#[from] vkbridge_protocol::StreamDecodeError),

    #[error("resource transfer: {0}")]
    Transfer(#[from] vkbridge_protocol::TransferError),

    #[error("unknown stream resource {0}")]
    UnknownResource(u32),

    #[error("unknown stream context {0}")]
    UnknownContext(u32),
}

impl HostError {
    /// Result code written back to the guest for this error.
    pub fn vk_result(&self) -> vk::Result {
        match self {
            Self::Driver(res) => *res,
            Self::FormatNotSupported(_) => vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            Self::ShutDown => vk::Result::ERROR_DEVICE_LOST,
            Self::InvalidHandle { .. }
            | Self::InvalidArgument(_)
            | Self::Stream(_)
            | Self::Transfer(_)
            | Self::UnknownResource(_)
            | Self::UnknownContext(_) => vk::Result::ERROR_UNKNOWN,
        }
    }
}

/// Log and abort on an internal invariant violation.
///
/// Reserved for states that mean host bookkeeping is already inconsistent (a queue without a
/// ledger, a dispatch table released twice, a registry entry without its handle record). Guest
/// mistakes must never reach this path.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::tracing::error!(target: "vkbridge::fatal", $($arg)+);
        ::std::process::abort()
    }};
}
pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_pass_through_verbatim() {
        let err = HostError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(err.vk_result(), vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    }

    #[test]
    fn guest_mistakes_map_to_generic_error() {
        let err = HostError::InvalidHandle {
            handle: BoxedHandle::NULL,
            expected: HandleKind::Image,
        };
        assert_eq!(err.vk_result(), vk::Result::ERROR_UNKNOWN);
    }
}
