//! Resource transfer addressing.
//!
//! A resource is a linear byte buffer of `width * height` pixels (or a set of YUV planes). Guest
//! transfers name a 2D box inside it; the box is validated against the declared dimensions and
//! turned into a `[offset, offset + len)` window of the linear buffer. The guest's backing iovecs
//! and the host's linear buffer share the same offset space.

use thiserror::Error;

/// Pixel formats a stream resource may be declared with (virgl numbering).
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceFormat {
    B8G8R8A8Unorm = 1,
    B8G8R8X8Unorm = 2,
    B5G6R5Unorm = 7,
    R10G10B10A2Unorm = 8,
    R16Unorm = 48,
    R8Unorm = 64,
    R8G8Unorm = 65,
    R8G8B8A8Unorm = 67,
    R16G16B16A16Float = 94,
    R8G8B8X8Unorm = 134,
    Yv12 = 163,
    Nv12 = 166,
    P010 = 314,
}

impl ResourceFormat {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::B8G8R8A8Unorm),
            2 => Some(Self::B8G8R8X8Unorm),
            7 => Some(Self::B5G6R5Unorm),
            8 => Some(Self::R10G10B10A2Unorm),
            48 => Some(Self::R16Unorm),
            64 => Some(Self::R8Unorm),
            65 => Some(Self::R8G8Unorm),
            67 => Some(Self::R8G8B8A8Unorm),
            94 => Some(Self::R16G16B16A16Float),
            134 => Some(Self::R8G8B8X8Unorm),
            163 => Some(Self::Yv12),
            166 => Some(Self::Nv12),
            314 => Some(Self::P010),
            _ => None,
        }
    }

    pub const fn is_yuv(self) -> bool {
        matches!(self, Self::Yv12 | Self::Nv12 | Self::P010)
    }

    /// Bytes per pixel for packed formats; `None` for planar YUV.
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::R16G16B16A16Float => Some(8),
            Self::B8G8R8A8Unorm
            | Self::B8G8R8X8Unorm
            | Self::R8G8B8A8Unorm
            | Self::R8G8B8X8Unorm
            | Self::R10G10B10A2Unorm => Some(4),
            Self::B5G6R5Unorm | Self::R8G8Unorm | Self::R16Unorm => Some(2),
            Self::R8Unorm => Some(1),
            Self::Yv12 | Self::Nv12 | Self::P010 => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer origin ({x}, {y}) outside {width}x{height} resource")]
    OriginOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    #[error("transfer box {b:?} overflows {width}x{height} resource")]
    BoxOverflow {
        b: TransferBox,
        width: u32,
        height: u32,
    },

    #[error("window [{start}, {start}+{len}) exceeds buffer of {available} bytes")]
    WindowOutOfBounds {
        start: usize,
        len: usize,
        available: usize,
    },

    #[error("resource of {size} bytes exceeds the {limit}-byte limit")]
    ResourceTooLarge { size: u64, limit: u64 },
}

/// Linear layout of a resource: its format and declared dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferLayout {
    pub format: ResourceFormat,
    pub width: u32,
    pub height: u32,
}

fn align_up(v: u64, align: u64) -> u64 {
    v.div_ceil(align) * align
}

impl TransferLayout {
    pub fn new(format: ResourceFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
        }
    }

    /// Row pitch of the first plane in bytes.
    pub fn stride(&self) -> u64 {
        match self.format.bytes_per_pixel() {
            Some(bpp) => u64::from(self.width) * u64::from(bpp),
            None => match self.format {
                ResourceFormat::Yv12 => align_up(u64::from(self.width), 32),
                ResourceFormat::P010 => u64::from(self.width) * 2,
                _ => u64::from(self.width),
            },
        }
    }

    /// Size in bytes of the whole linear buffer. Saturates at `u64::MAX`.
    pub fn linear_size(&self) -> u64 {
        let w = u64::from(self.width);
        let h = u64::from(self.height);
        let chroma = w.div_ceil(2).saturating_mul(h.div_ceil(2));
        match self.format {
            ResourceFormat::Nv12 => w.saturating_mul(h).saturating_add(chroma.saturating_mul(2)),
            ResourceFormat::P010 => w
                .saturating_mul(h)
                .saturating_mul(2)
                .saturating_add(chroma.saturating_mul(4)),
            ResourceFormat::Yv12 => {
                let y_stride = align_up(w, 32);
                let uv_stride = align_up(y_stride / 2, 16);
                y_stride
                    .saturating_mul(h)
                    .saturating_add(uv_stride.saturating_mul(2).saturating_mul(h.div_ceil(2)))
            }
            _ => self.stride().saturating_mul(h),
        }
    }

    /// Validate `b` and return the `(offset, len)` window it covers, or `None` for an empty box.
    pub fn window(&self, b: TransferBox) -> Result<Option<(u64, u64)>, TransferError> {
        if b.x > self.width || b.y > self.height {
            return Err(TransferError::OriginOutOfBounds {
                x: b.x,
                y: b.y,
                width: self.width,
                height: self.height,
            });
        }
        if b.w == 0 || b.h == 0 {
            return Ok(None);
        }
        let fits_x = b.x.checked_add(b.w).is_some_and(|end| end <= self.width);
        let fits_y = b.y.checked_add(b.h).is_some_and(|end| end <= self.height);
        if !fits_x || !fits_y {
            return Err(TransferError::BoxOverflow {
                b,
                width: self.width,
                height: self.height,
            });
        }

        // Planar formats always move every plane in full.
        let Some(bpp) = self.format.bytes_per_pixel() else {
            return Ok(Some((0, self.linear_size())));
        };
        let bpp = u64::from(bpp);
        let stride = self.stride();
        let base = u64::from(b.y) * stride + u64::from(b.x) * bpp;
        let len = u64::from(b.h - 1) * stride + u64::from(b.w) * bpp;
        Ok(Some((base, len)))
    }
}

fn check_window(start: usize, len: usize, available: usize) -> Result<(), TransferError> {
    match start.checked_add(len) {
        Some(end) if end <= available => Ok(()),
        _ => Err(TransferError::WindowOutOfBounds {
            start,
            len,
            available,
        }),
    }
}

/// Gather `[start, start + len)` of the concatenated `iovs` into the same range of `linear`.
pub fn copy_iovecs_to_linear(
    iovs: &[&[u8]],
    linear: &mut [u8],
    start: usize,
    len: usize,
) -> Result<(), TransferError> {
    let iov_total: usize = iovs.iter().map(|iov| iov.len()).sum();
    check_window(start, len, iov_total)?;
    check_window(start, len, linear.len())?;

    let end = start + len;
    let mut iov_base = 0usize;
    for iov in iovs {
        let iov_end = iov_base + iov.len();
        let lo = start.max(iov_base);
        let hi = end.min(iov_end);
        if lo < hi {
            linear[lo..hi].copy_from_slice(&iov[lo - iov_base..hi - iov_base]);
        }
        if iov_end >= end {
            break;
        }
        iov_base = iov_end;
    }
    Ok(())
}

/// Scatter `[start, start + len)` of `linear` into the same range of the concatenated `iovs`.
pub fn copy_linear_to_iovecs(
    linear: &[u8],
    iovs: &mut [&mut [u8]],
    start: usize,
    len: usize,
) -> Result<(), TransferError> {
    let iov_total: usize = iovs.iter().map(|iov| iov.len()).sum();
    check_window(start, len, iov_total)?;
    check_window(start, len, linear.len())?;

    let end = start + len;
    let mut iov_base = 0usize;
    for iov in iovs.iter_mut() {
        let iov_end = iov_base + iov.len();
        let lo = start.max(iov_base);
        let hi = end.min(iov_end);
        if lo < hi {
            iov[lo - iov_base..hi - iov_base].copy_from_slice(&linear[lo..hi]);
        }
        if iov_end >= end {
            break;
        }
        iov_base = iov_end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_window_uses_row_pitch() {
        let layout = TransferLayout::new(ResourceFormat::R8G8B8A8Unorm, 16, 8);
        let window = layout
            .window(TransferBox {
                x: 2,
                y: 3,
                w: 4,
                h: 2,
            })
            .unwrap();
        // base = 3 * 64 + 2 * 4, len = 1 * 64 + 4 * 4
        assert_eq!(window, Some((200, 80)));
    }

    #[test]
    fn huge_layouts_saturate() {
        for format in [ResourceFormat::R8G8B8A8Unorm, ResourceFormat::Nv12, ResourceFormat::P010] {
            let layout = TransferLayout::new(format, u32::MAX, u32::MAX);
            assert_eq!(layout.linear_size(), u64::MAX, "{format:?}");
        }
    }

    #[test]
    fn empty_box_is_a_noop() {
        let layout = TransferLayout::new(ResourceFormat::R8Unorm, 4, 4);
        assert_eq!(
            layout.window(TransferBox { x: 4, y: 0, w: 0, h: 4 }),
            Ok(None)
        );
    }

    #[test]
    fn yuv_transfers_whole_planes() {
        let layout = TransferLayout::new(ResourceFormat::Nv12, 4, 4);
        assert_eq!(
            layout.window(TransferBox { x: 1, y: 1, w: 1, h: 1 }),
            Ok(Some((0, 24)))
        );
    }
}
