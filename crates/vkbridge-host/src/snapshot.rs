//! Save/restore of guest-visible handle identities.
//!
//! Handle values are part of the guest's state: after a restore, the guest replays its object
//! creations and must receive exactly the handles it held before. The snapshot is therefore
//! just the ordered list of live `(kind, handle)` pairs.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic   "VKBH"
//! version u16
//! count   u32
//! entries count x { kind u8, handle u64 }
//! ```

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::debug;

use crate::handle::{BoxedHandle, HandleKind};
use crate::registry::Registry;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"VKBH";
pub const SNAPSHOT_VERSION: u16 = 1;

const HEADER_BYTES: usize = 4 + 2 + 4;
const ENTRY_BYTES: usize = 1 + 8;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

fn read_array<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_header<W: Write>(w: &mut W, count: u32) -> Result<()> {
    let mut header = [0u8; HEADER_BYTES];
    header[..4].copy_from_slice(&SNAPSHOT_MAGIC);
    header[4..6].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    header[6..].copy_from_slice(&count.to_le_bytes());
    w.write_all(&header)?;
    Ok(())
}

/// Checks magic and version; returns the entry count.
fn read_header<R: Read>(r: &mut R) -> Result<u32> {
    if read_array::<4, _>(r)? != SNAPSHOT_MAGIC {
        return Err(SnapshotError::InvalidMagic);
    }
    let version = u16::from_le_bytes(read_array(r)?);
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    Ok(u32::from_le_bytes(read_array(r)?))
}

fn write_entry<W: Write>(w: &mut W, handle: BoxedHandle) -> Result<()> {
    let kind = handle
        .kind()
        .ok_or(SnapshotError::Corrupt("handle without a kind tag"))?;
    let mut entry = [0u8; ENTRY_BYTES];
    entry[0] = kind as u8;
    entry[1..].copy_from_slice(&handle.raw().to_le_bytes());
    w.write_all(&entry)?;
    Ok(())
}

/// One entry, checked against its kind tag.
fn read_entry<R: Read>(r: &mut R) -> Result<BoxedHandle> {
    let [tag, raw @ ..] = read_array::<ENTRY_BYTES, _>(r)?;
    let kind = HandleKind::from_u8(tag).ok_or(SnapshotError::Corrupt("unknown handle kind"))?;
    let handle = BoxedHandle::from_raw(u64::from_le_bytes(raw));
    if handle.is_null() {
        return Err(SnapshotError::Corrupt("null handle"));
    }
    if handle.kind() != Some(kind) {
        return Err(SnapshotError::Corrupt("handle kind tag mismatch"));
    }
    Ok(handle)
}

/// Live handles in creation order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentitySnapshot {
    pub handles: Vec<BoxedHandle>,
}

impl IdentitySnapshot {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        let count: u32 = self
            .handles
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("too many handles"))?;
        write_header(w, count)?;
        for &handle in &self.handles {
            write_entry(w, handle)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_BYTES + self.handles.len() * ENTRY_BYTES);
        self.encode(&mut out)?;
        Ok(out)
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let count = read_header(r)? as usize;
        // Never trust the count for the allocation size.
        let mut handles = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            handles.push(read_entry(r)?);
        }
        Ok(Self { handles })
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let snapshot = Self::decode(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(SnapshotError::Corrupt("trailing bytes"));
        }
        Ok(snapshot)
    }
}

impl Registry {
    /// Every live guest handle, oldest first.
    pub fn save_identities(&self) -> IdentitySnapshot {
        let handles = self.handles().live_handles();
        debug!(count = handles.len(), "handle identities saved");
        IdentitySnapshot { handles }
    }

    /// Arrange for the guest's replayed creations to receive the handles in `snapshot`.
    pub fn begin_restore(&self, snapshot: &IdentitySnapshot) {
        debug!(count = snapshot.handles.len(), "handle identities seeded for restore");
        self.handles()
            .load_created_handles(snapshot.handles.iter().copied());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn sample() -> IdentitySnapshot {
        IdentitySnapshot {
            handles: vec![
                BoxedHandle::new(HandleKind::Instance, 1, 0),
                BoxedHandle::new(HandleKind::Device, 3, 7),
                BoxedHandle::new(HandleKind::Queue, 1, 70_000),
            ],
        }
    }

    #[test]
    fn encoding_is_stable() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"VKBH");
        assert_eq!(&bytes[4..6], &1u16.to_le_bytes());
        assert_eq!(&bytes[6..10], &3u32.to_le_bytes());
        assert_eq!(bytes.len(), HEADER_BYTES + 3 * ENTRY_BYTES);
        assert_eq!(bytes[10], HandleKind::Instance as u8);
        assert_eq!(IdentitySnapshot::from_bytes(&bytes).unwrap(), sample());
    }

    #[test]
    fn rejects_bad_headers_and_tags() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(IdentitySnapshot::from_bytes(&bytes), Err(SnapshotError::InvalidMagic)));

        let mut bytes = sample().to_bytes().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            IdentitySnapshot::from_bytes(&bytes),
            Err(SnapshotError::UnsupportedVersion(9))
        ));

        let mut bytes = sample().to_bytes().unwrap();
        bytes[10] = HandleKind::Image as u8;
        assert!(matches!(IdentitySnapshot::from_bytes(&bytes), Err(SnapshotError::Corrupt(_))));

        let mut bytes = sample().to_bytes().unwrap();
        bytes[HEADER_BYTES + 1..HEADER_BYTES + ENTRY_BYTES].fill(0);
        assert!(matches!(
            IdentitySnapshot::from_bytes(&bytes),
            Err(SnapshotError::Corrupt("null handle"))
        ));

        let bytes = sample().to_bytes().unwrap();
        assert!(matches!(
            IdentitySnapshot::from_bytes(&bytes[..bytes.len() - 1]),
            Err(SnapshotError::Io(_))
        ));
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = IdentitySnapshot::from_bytes(&bytes);
        }

        #[test]
        fn decode_with_valid_header_never_panics(
            count in any::<u32>(),
            tail in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let mut bytes = b"VKBH".to_vec();
            bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
            bytes.extend_from_slice(&count.to_le_bytes());
            bytes.extend_from_slice(&tail);
            let _ = IdentitySnapshot::from_bytes(&bytes);
        }
    }
}
