//! Pixel geometry, pixel encodings and frame rates supported by the capture engine.
//!
//! Everything here is a plain value type. The only failure mode is a value
//! outside the closed sets, which is rejected on conversion before any
//! hardware is touched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Pack a width/height pair into a single `u32` (`width << 16 | height`).
#[must_use]
pub const fn pack_dimensions(width: u32, height: u32) -> u32 {
    (width << 16) | (height & 0xFFFF)
}

/// Unpack a value produced by [`pack_dimensions`] into `(width, height)`.
#[must_use]
pub const fn unpack_dimensions(packed: u32) -> (u32, u32) {
    (packed >> 16, packed & 0xFFFF)
}

/// Four-character code identifying a pixel encoding (e.g., YUYV, MJPG).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");

    /// Decode the little-endian 32-bit value the kernel uses.
    #[must_use]
    pub const fn from_u32(code: u32) -> Self {
        Self(code.to_le_bytes())
    }

    /// The little-endian 32-bit value the kernel uses.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl FromStr for FourCC {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| CaptureError::Config(format!("'{s}' is not a four-character code")))?;
        Ok(Self(bytes))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Frame geometry as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride). Zero in a request lets the driver choose.
    pub stride: u32,
    /// Total frame size in bytes. Zero in a request lets the driver choose.
    pub size: u32,
}

impl Format {
    /// Create a format request; stride and size are left for the driver to fill in.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc,
            stride: 0,
            size: 0,
        }
    }
}

/// Supported capture resolutions, each a packed width/height pair.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelDimension {
    /// 1280x720
    #[default]
    #[serde(rename = "HD")]
    Hd = pack_dimensions(1280, 720),
    /// 1920x1080
    #[serde(rename = "FHD")]
    Fhd = pack_dimensions(1920, 1080),
    /// 2048x1080
    #[serde(rename = "2K")]
    Dci2k = pack_dimensions(2048, 1080),
    /// 3840x2160
    #[serde(rename = "4K")]
    Uhd4k = pack_dimensions(3840, 2160),
}

impl PixelDimension {
    /// Every supported dimension, smallest first.
    pub const ALL: [Self; 4] = [Self::Hd, Self::Fhd, Self::Dci2k, Self::Uhd4k];

    /// The packed representation.
    #[must_use]
    pub const fn packed(self) -> u32 {
        self as u32
    }

    /// Look up the dimension for a packed value.
    #[must_use]
    pub fn from_packed(packed: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|dim| dim.packed() == packed)
    }

    /// `(width, height)` in pixels.
    #[must_use]
    pub const fn size(self) -> (u32, u32) {
        unpack_dimensions(self.packed())
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(self) -> u32 {
        self.size().0
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(self) -> u32 {
        self.size().1
    }
}

impl fmt::Display for PixelDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (width, height) = self.size();
        write!(f, "{width}x{height}")
    }
}

/// Supported pixel encodings, each carrying its four-character hardware code.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Motion JPEG, variable-size compressed frames.
    #[default]
    #[serde(rename = "MJPEG", alias = "MJPG")]
    Mjpeg = FourCC::MJPG.to_u32(),
    /// YUYV 4:2:2 packed.
    #[serde(rename = "YUYV", alias = "YUY2")]
    Yuyv = FourCC::YUYV.to_u32(),
}

impl PixelFormat {
    /// Every supported encoding.
    pub const ALL: [Self; 2] = [Self::Mjpeg, Self::Yuyv];

    /// The hardware four-character code.
    #[must_use]
    pub const fn fourcc(self) -> FourCC {
        FourCC::from_u32(self as u32)
    }
}

impl TryFrom<FourCC> for PixelFormat {
    type Error = CaptureError;

    fn try_from(fourcc: FourCC) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|format| format.fourcc() == fourcc)
            .ok_or(CaptureError::UnsupportedFormat(fourcc))
    }
}

impl TryFrom<u32> for PixelFormat {
    type Error = CaptureError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::try_from(FourCC::from_u32(code))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fourcc().fmt(f)
    }
}

/// Supported capture frame rates.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum FrameRate {
    /// 15 frames per second.
    Fps15 = 15,
    /// 30 frames per second.
    #[default]
    Fps30 = 30,
    /// 60 frames per second.
    Fps60 = 60,
}

impl FrameRate {
    /// Frames per second.
    #[must_use]
    pub const fn fps(self) -> u32 {
        self as u32
    }

    /// Time per frame as the `1 / rate` fraction the driver expects.
    #[must_use]
    pub fn interval(self) -> v4l::Fraction {
        v4l::Fraction::new(1, self.fps())
    }
}

impl TryFrom<u32> for FrameRate {
    type Error = CaptureError;

    fn try_from(fps: u32) -> Result<Self, Self::Error> {
        match fps {
            15 => Ok(Self::Fps15),
            30 => Ok(Self::Fps30),
            60 => Ok(Self::Fps60),
            other => Err(CaptureError::Config(format!(
                "unsupported frame rate {other} (expected 15, 30 or 60)"
            ))),
        }
    }
}

impl From<FrameRate> for u32 {
    fn from(rate: FrameRate) -> Self {
        rate.fps()
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fps", self.fps())
    }
}
