//! Stream commands submitted by the guest through `submit_cmd`.
//!
//! Each command is a 4-byte opcode header followed by a fixed-layout payload of 32-bit words.
//! The payload size is implied by the opcode; trailing bytes past the fixed layout are ignored
//! (older guests pad submissions to a cache line).

use thiserror::Error;

use crate::{join_u64, split_u64};

pub const STREAM_HDR_SIZE_BYTES: usize = 4;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamOpcode {
    ContextCreate = 0x1001,
    ContextPing = 0x1002,
    ContextPingWithResponse = 0x1003,

    CreateExportSync = 0x9000,
    CreateImportSync = 0x9001,

    CreateExportSyncVk = 0xa000,
    CreateImportSyncVk = 0xa001,
    CreateQsriExportVk = 0xa002,
}

impl StreamOpcode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x1001 => Some(Self::ContextCreate),
            0x1002 => Some(Self::ContextPing),
            0x1003 => Some(Self::ContextPingWithResponse),
            0x9000 => Some(Self::CreateExportSync),
            0x9001 => Some(Self::CreateImportSync),
            0xa000 => Some(Self::CreateExportSyncVk),
            0xa001 => Some(Self::CreateImportSyncVk),
            0xa002 => Some(Self::CreateQsriExportVk),
            _ => None,
        }
    }

    /// Total encoded size (header included) of a command with this opcode.
    pub const fn size_bytes(self) -> usize {
        STREAM_HDR_SIZE_BYTES
            + match self {
                Self::ContextCreate | Self::ContextPing => 4,
                Self::ContextPingWithResponse => 8,
                Self::CreateExportSync | Self::CreateImportSync => 8,
                Self::CreateExportSyncVk | Self::CreateImportSyncVk => 16,
                Self::CreateQsriExportVk => 8,
            }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamCmd {
    ContextCreate {
        resource_id: u32,
    },
    ContextPing {
        resource_id: u32,
    },
    ContextPingWithResponse {
        resource_id: u32,
        resp_resource_id: u32,
    },
    /// Export a guest-visible sync object backed by a host GL-style fence.
    CreateExportSync {
        sync_handle: u64,
    },
    CreateImportSync {
        sync_handle: u64,
    },
    /// Export a sync object backed by a host-managed compute-API fence.
    CreateExportSyncVk {
        device_handle: u64,
        fence_handle: u64,
    },
    CreateImportSyncVk {
        device_handle: u64,
        fence_handle: u64,
    },
    /// Export the presentation-release signal of an image.
    CreateQsriExportVk {
        image_handle: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum StreamDecodeError {
    #[error("stream command buffer too small ({found} bytes)")]
    BufferTooSmall { found: usize },

    #[error("unknown stream opcode 0x{found:x}")]
    UnknownOpcode { found: u32 },

    #[error("payload for {opcode:?} needs {expected} bytes, found {found}")]
    PayloadSizeMismatch {
        opcode: StreamOpcode,
        expected: usize,
        found: usize,
    },
}

#[inline]
fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
fn le_u64_pair(buf: &[u8], at: usize) -> u64 {
    join_u64(le_u32(buf, at), le_u32(buf, at + 4))
}

/// Decode just the opcode word.
pub fn decode_stream_opcode_le(buf: &[u8]) -> Result<StreamOpcode, StreamDecodeError> {
    if buf.len() < STREAM_HDR_SIZE_BYTES {
        return Err(StreamDecodeError::BufferTooSmall { found: buf.len() });
    }
    let raw = le_u32(buf, 0);
    StreamOpcode::from_u32(raw).ok_or(StreamDecodeError::UnknownOpcode { found: raw })
}

impl StreamCmd {
    pub fn opcode(&self) -> StreamOpcode {
        match self {
            Self::ContextCreate { .. } => StreamOpcode::ContextCreate,
            Self::ContextPing { .. } => StreamOpcode::ContextPing,
            Self::ContextPingWithResponse { .. } => StreamOpcode::ContextPingWithResponse,
            Self::CreateExportSync { .. } => StreamOpcode::CreateExportSync,
            Self::CreateImportSync { .. } => StreamOpcode::CreateImportSync,
            Self::CreateExportSyncVk { .. } => StreamOpcode::CreateExportSyncVk,
            Self::CreateImportSyncVk { .. } => StreamOpcode::CreateImportSyncVk,
            Self::CreateQsriExportVk { .. } => StreamOpcode::CreateQsriExportVk,
        }
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, StreamDecodeError> {
        let opcode = decode_stream_opcode_le(buf)?;
        let expected = opcode.size_bytes();
        if buf.len() < expected {
            return Err(StreamDecodeError::PayloadSizeMismatch {
                opcode,
                expected,
                found: buf.len(),
            });
        }

        let p = STREAM_HDR_SIZE_BYTES;
        Ok(match opcode {
            StreamOpcode::ContextCreate => Self::ContextCreate {
                resource_id: le_u32(buf, p),
            },
            StreamOpcode::ContextPing => Self::ContextPing {
                resource_id: le_u32(buf, p),
            },
            StreamOpcode::ContextPingWithResponse => Self::ContextPingWithResponse {
                resource_id: le_u32(buf, p),
                resp_resource_id: le_u32(buf, p + 4),
            },
            StreamOpcode::CreateExportSync => Self::CreateExportSync {
                sync_handle: le_u64_pair(buf, p),
            },
            StreamOpcode::CreateImportSync => Self::CreateImportSync {
                sync_handle: le_u64_pair(buf, p),
            },
            StreamOpcode::CreateExportSyncVk => Self::CreateExportSyncVk {
                device_handle: le_u64_pair(buf, p),
                fence_handle: le_u64_pair(buf, p + 8),
            },
            StreamOpcode::CreateImportSyncVk => Self::CreateImportSyncVk {
                device_handle: le_u64_pair(buf, p),
                fence_handle: le_u64_pair(buf, p + 8),
            },
            StreamOpcode::CreateQsriExportVk => Self::CreateQsriExportVk {
                image_handle: le_u64_pair(buf, p),
            },
        })
    }

    /// Encode the command as the guest would submit it.
    pub fn encode_to_le_bytes(&self) -> Vec<u8> {
        let opcode = self.opcode();
        let mut out = Vec::with_capacity(opcode.size_bytes());
        push_u32(&mut out, opcode as u32);
        match *self {
            Self::ContextCreate { resource_id } | Self::ContextPing { resource_id } => {
                push_u32(&mut out, resource_id);
            }
            Self::ContextPingWithResponse {
                resource_id,
                resp_resource_id,
            } => {
                push_u32(&mut out, resource_id);
                push_u32(&mut out, resp_resource_id);
            }
            Self::CreateExportSync { sync_handle } | Self::CreateImportSync { sync_handle } => {
                push_u64_pair(&mut out, sync_handle);
            }
            Self::CreateExportSyncVk {
                device_handle,
                fence_handle,
            }
            | Self::CreateImportSyncVk {
                device_handle,
                fence_handle,
            } => {
                push_u64_pair(&mut out, device_handle);
                push_u64_pair(&mut out, fence_handle);
            }
            Self::CreateQsriExportVk { image_handle } => {
                push_u64_pair(&mut out, image_handle);
            }
        }
        debug_assert_eq!(out.len(), opcode.size_bytes());
        out
    }
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64_pair(out: &mut Vec<u8>, v: u64) {
    let (lo, hi) = split_u64(v);
    push_u32(out, lo);
    push_u32(out, hi);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_match_wire_constants() {
        assert_eq!(StreamOpcode::ContextCreate as u32, 0x1001);
        assert_eq!(StreamOpcode::CreateExportSync as u32, 0x9000);
        assert_eq!(StreamOpcode::CreateQsriExportVk as u32, 0xa002);
        assert_eq!(StreamOpcode::from_u32(0xa001), Some(StreamOpcode::CreateImportSyncVk));
        assert_eq!(StreamOpcode::from_u32(0xdead), None);
    }

    #[test]
    fn handles_are_split_low_word_first() {
        let bytes = StreamCmd::CreateExportSyncVk {
            device_handle: 0x0000_0002_0000_0001,
            fence_handle: 0x0000_0004_0000_0003,
        }
        .encode_to_le_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(le_u32(&bytes, 4), 1);
        assert_eq!(le_u32(&bytes, 8), 2);
        assert_eq!(le_u32(&bytes, 12), 3);
        assert_eq!(le_u32(&bytes, 16), 4);
    }

    #[test]
    fn short_header_is_rejected() {
        assert_eq!(
            StreamCmd::decode_from_le_bytes(&[0x01, 0x10]),
            Err(StreamDecodeError::BufferTooSmall { found: 2 })
        );
    }
}
