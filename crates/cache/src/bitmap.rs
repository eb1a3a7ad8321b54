//! Pixel buffers and cache keys
//!
//! A [`Bitmap`] separates its logical geometry (width, height, format) from
//! its backing allocation. Pooled buffers are reconfigured in place, so a
//! bitmap may own more bytes than its pixels need; caches account for the
//! allocation, not the geometry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixel layout of a bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8 bits per channel, RGBA order
    Rgba8888,

    /// 16 bits per pixel, little-endian 5-6-5 RGB
    Rgb565,
}

impl PixelFormat {
    /// All supported formats
    pub const ALL: [PixelFormat; 2] = [PixelFormat::Rgba8888, PixelFormat::Rgb565];

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8888 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }

    /// Stable lowercase name, used in disk cache filenames
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgba8888 => "rgba8888",
            PixelFormat::Rgb565 => "rgb565",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rgba8888" => Ok(PixelFormat::Rgba8888),
            "rgb565" => Ok(PixelFormat::Rgb565),
            other => Err(format!("unknown pixel format: {other}")),
        }
    }
}

/// Named rendering configuration trading memory for color fidelity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    /// Full color, print-quality rendering
    HighDetail,

    /// Full color, screen-quality rendering
    Balanced,

    /// 16-bit color, half the memory of the other profiles
    LowMemory,
}

impl QualityProfile {
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            QualityProfile::HighDetail | QualityProfile::Balanced => PixelFormat::Rgba8888,
            QualityProfile::LowMemory => PixelFormat::Rgb565,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityProfile::HighDetail => "high_detail",
            QualityProfile::Balanced => "balanced",
            QualityProfile::LowMemory => "low_memory",
        }
    }
}

impl FromStr for QualityProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high_detail" | "high" => Ok(QualityProfile::HighDetail),
            "balanced" => Ok(QualityProfile::Balanced),
            "low_memory" | "low" => Ok(QualityProfile::LowMemory),
            other => Err(format!("unknown quality profile: {other}")),
        }
    }
}

/// Immutable cache key for a rendered page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageBitmapKey {
    pub page_index: u32,
    pub target_width: u32,
    pub quality: QualityProfile,
}

impl PageBitmapKey {
    pub fn new(page_index: u32, target_width: u32, quality: QualityProfile) -> Self {
        Self {
            page_index,
            target_width,
            quality,
        }
    }
}

/// Bytes needed for a bitmap of the given geometry, or `None` on overflow
pub fn required_bytes(width: u32, height: u32, format: PixelFormat) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(format.bytes_per_pixel())
}

/// Failed to allocate pixel memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("failed to allocate {bytes} bytes for a {width}x{height} bitmap")]
pub struct AllocationError {
    pub bytes: usize,
    pub width: u32,
    pub height: u32,
}

/// Pixel data did not match the declared geometry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected} bytes for {width}x{height} {format}, got {actual}")]
pub struct GeometryError {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub expected: usize,
    pub actual: usize,
}

/// A pixel buffer with reconfigurable geometry
#[derive(Debug, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    mutable: bool,
}

impl Bitmap {
    /// Allocate a zero-filled bitmap, reporting allocation failure instead of aborting
    pub fn try_new(width: u32, height: u32, format: PixelFormat) -> Result<Self, AllocationError> {
        let bytes = required_bytes(width, height, format).ok_or(AllocationError {
            bytes: usize::MAX,
            width,
            height,
        })?;

        let mut data = Vec::new();
        data.try_reserve_exact(bytes).map_err(|_| AllocationError {
            bytes,
            width,
            height,
        })?;
        data.resize(bytes, 0);

        Ok(Self {
            width,
            height,
            format,
            data,
            mutable: true,
        })
    }

    /// Wrap existing pixel data; the length must match the geometry exactly
    pub fn from_pixels(
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: Vec<u8>,
    ) -> Result<Self, GeometryError> {
        let expected = required_bytes(width, height, format).unwrap_or(usize::MAX);
        if pixels.len() != expected {
            return Err(GeometryError {
                width,
                height,
                format,
                expected,
                actual: pixels.len(),
            });
        }

        Ok(Self {
            width,
            height,
            format,
            data: pixels,
            mutable: true,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes covered by the logical geometry
    pub fn byte_count(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// Bytes owned by the backing allocation
    pub fn allocation_bytes(&self) -> usize {
        self.data.len()
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data[..self.byte_count()]
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        let len = self.byte_count();
        &mut self.data[..len]
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Mark the bitmap read-only; the pool refuses to recycle it afterwards
    pub fn freeze(&mut self) {
        self.mutable = false;
    }

    /// Change the logical geometry without reallocating
    ///
    /// Returns false (leaving the bitmap untouched) if the allocation is too small.
    pub fn reconfigure(&mut self, width: u32, height: u32, format: PixelFormat) -> bool {
        match required_bytes(width, height, format) {
            Some(bytes) if bytes <= self.data.len() => {
                self.width = width;
                self.height = height;
                self.format = format;
                true
            }
            _ => false,
        }
    }

    /// Zero the whole allocation, including bytes beyond the logical geometry
    pub fn zero_fill(&mut self) {
        self.data.fill(0);
    }

    /// Fill every pixel with one RGBA color, converted to the bitmap's format
    pub fn fill_rgba(&mut self, rgba: [u8; 4]) {
        self.fill_rect(0, 0, self.width, self.height, rgba);
    }

    /// Fill `[x0, x1) x [y0, y1)`, clamped to the bitmap
    pub fn fill_rect(&mut self, x0: u32, y0: u32, x1: u32, y1: u32, rgba: [u8; 4]) {
        let x1 = x1.min(self.width);
        let y1 = y1.min(self.height);
        if x0 >= x1 || y0 >= y1 {
            return;
        }

        let bpp = self.format.bytes_per_pixel();
        let encoded = match self.format {
            PixelFormat::Rgba8888 => rgba,
            PixelFormat::Rgb565 => {
                let [lo, hi] = pack_rgb565(rgba[0], rgba[1], rgba[2]).to_le_bytes();
                [lo, hi, 0, 0]
            }
        };

        let stride = self.stride();
        for y in y0 as usize..y1 as usize {
            let start = y * stride + x0 as usize * bpp;
            let end = y * stride + x1 as usize * bpp;
            for pixel in self.data[start..end].chunks_exact_mut(bpp) {
                pixel.copy_from_slice(&encoded[..bpp]);
            }
        }
    }

    /// Copy pixels from an RGBA8 source, starting at `(src_x, src_y)` in the source
    ///
    /// Target pixels the source does not cover are left untouched.
    pub fn copy_from_rgba(&mut self, src: &[u8], src_width: u32, src_x: u32, src_y: u32) {
        let src_stride = src_width as usize * 4;
        if src_stride == 0 {
            return;
        }
        let src_height = (src.len() / src_stride) as u32;
        let cols = src_width.saturating_sub(src_x).min(self.width) as usize;
        let rows = src_height.saturating_sub(src_y).min(self.height) as usize;

        let bpp = self.format.bytes_per_pixel();
        let stride = self.stride();
        for row in 0..rows {
            let src_start = (src_y as usize + row) * src_stride + src_x as usize * 4;
            let source = &src[src_start..src_start + cols * 4];
            let target = &mut self.data[row * stride..row * stride + cols * bpp];
            match self.format {
                PixelFormat::Rgba8888 => target.copy_from_slice(source),
                PixelFormat::Rgb565 => {
                    for (out, px) in target.chunks_exact_mut(2).zip(source.chunks_exact(4)) {
                        out.copy_from_slice(&pack_rgb565(px[0], px[1], px[2]).to_le_bytes());
                    }
                }
            }
        }
    }

    /// Copy with an exact-size allocation
    pub fn try_copy(&self) -> Result<Bitmap, AllocationError> {
        let bytes = self.byte_count();
        let mut data = Vec::new();
        data.try_reserve_exact(bytes).map_err(|_| AllocationError {
            bytes,
            width: self.width,
            height: self.height,
        })?;
        data.extend_from_slice(self.pixels());

        Ok(Bitmap {
            width: self.width,
            height: self.height,
            format: self.format,
            data,
            mutable: true,
        })
    }

    /// Pixels expanded to 8-bit RGBA
    pub fn to_rgba8(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Rgba8888 => self.pixels().to_vec(),
            PixelFormat::Rgb565 => {
                let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 4);
                for pixel in self.pixels().chunks_exact(2) {
                    let [r, g, b] = unpack_rgb565(u16::from_le_bytes([pixel[0], pixel[1]]));
                    out.extend_from_slice(&[r, g, b, 255]);
                }
                out
            }
        }
    }
}

/// Pack 8-bit channels into 5-6-5
pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// Expand 5-6-5 to 8-bit channels by bit replication; `pack_rgb565` inverts it exactly
pub fn unpack_rgb565(value: u16) -> [u8; 3] {
    let r5 = ((value >> 11) & 0x1f) as u8;
    let g6 = ((value >> 5) & 0x3f) as u8;
    let b5 = (value & 0x1f) as u8;
    [
        (r5 << 3) | (r5 >> 2),
        (g6 << 2) | (g6 >> 4),
        (b5 << 3) | (b5 >> 2),
    ]
}
