use super::CompressedFormat;

/// CPU block decoder, implemented outside this crate.
///
/// The registry only asks whether decoding is possible and hands over tightly packed blocks.
pub trait CpuDecompressor: Send + Sync {
    /// Whether the decoder loaded and can be used at all.
    fn available(&self) -> bool;

    fn supports(&self, format: &CompressedFormat) -> bool;

    /// Decode a tightly packed `width x height` block buffer into linear texels of
    /// `format.decompressed_format()`. `output` is exactly
    /// `format.decompressed_size(width, height)` bytes.
    fn decompress(
        &self,
        format: &CompressedFormat,
        width: u32,
        height: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), i32>;

    fn error_string(&self, code: i32) -> String;
}

/// Decoder used when none is configured. Emulated images still get their raw-block copies;
/// the shadow just stays undefined.
#[derive(Debug, Default)]
pub struct NoCpuDecompressor;

impl CpuDecompressor for NoCpuDecompressor {
    fn available(&self) -> bool {
        false
    }

    fn supports(&self, _format: &CompressedFormat) -> bool {
        false
    }

    fn decompress(
        &self,
        _format: &CompressedFormat,
        _width: u32,
        _height: u32,
        _input: &[u8],
        _output: &mut [u8],
    ) -> Result<(), i32> {
        Err(-1)
    }

    fn error_string(&self, _code: i32) -> String {
        "no CPU decompressor configured".to_string()
    }
}
