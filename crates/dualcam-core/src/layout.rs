//! Composite frame layout: plane offsets and plane extraction.
//!
//! One USB delivery from the dual-sensor module is a single buffer of six
//! contiguous planes in a fixed order. Every offset is the running prefix
//! sum of the plane lengths, and every length is a function of three
//! resolution pairs only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("frame out of range: need {required} bytes, got {actual}")]
    OutOfRange { required: usize, actual: usize },
    #[error("destination for {plane} plane: expected {expected} bytes, got {actual}")]
    DestinationSize {
        plane: Plane,
        expected: usize,
        actual: usize,
    },
    #[error("plane buffers were sized for a different layout")]
    LayoutMismatch,
    #[error("invalid resolution {0:?}: expected WIDTHxHEIGHT")]
    InvalidResolution(String),
}

/// Width and height of one sensor or output surface, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Resolution of an absent plane.
    pub const NONE: Self = Self::new(0, 0);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.pixels() == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = LayoutError;

    /// Parse `"256x192"` (an upper-case `X` is accepted too).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LayoutError::InvalidResolution(s.to_string());
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(invalid)?;
        let width = w.trim().parse().map_err(|_| invalid())?;
        let height = h.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(width, height))
    }
}

/// The three resolution pairs a composite frame is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resolutions {
    /// Thermal sensor resolution (`Ws×Hs`).
    pub sensor: Resolution,
    /// Visible-light sensor resolution (`Wv×Hv`).
    pub visible: Resolution,
    /// Fused output resolution (`Wd×Hd`).
    pub dual: Resolution,
}

impl Resolutions {
    pub const fn new(sensor: Resolution, visible: Resolution, dual: Resolution) -> Self {
        Self {
            sensor,
            visible,
            dual,
        }
    }

    /// Same resolution for all three surfaces.
    pub const fn uniform(res: Resolution) -> Self {
        Self::new(res, res, res)
    }

    /// Thermal-only stream: raw image and temperature planes, nothing else.
    pub const fn ir_only(sensor: Resolution) -> Self {
        Self::new(sensor, Resolution::NONE, Resolution::NONE)
    }

    /// Visible-only stream: a single RGB24 plane.
    pub const fn visible_only(visible: Resolution) -> Self {
        Self::new(Resolution::NONE, visible, Resolution::NONE)
    }
}

/// Planes of a composite frame, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plane {
    /// Fused image, ARGB at the dual resolution.
    Fusion = 0,
    /// Raw infrared image, YUV422 (Y16) at the sensor resolution.
    RawIr = 1,
    /// Raw temperature samples, Y16 at the sensor resolution.
    RawTemperature = 2,
    /// Temperature remapped onto the dual resolution.
    RemappedTemperature = 3,
    /// Raw visible-light image, RGB24 at the visible resolution.
    RawVisible = 4,
    /// Picture-in-picture visible image, ARGB at the dual resolution.
    PictureInPicture = 5,
}

impl Plane {
    pub const ALL: [Plane; 6] = [
        Plane::Fusion,
        Plane::RawIr,
        Plane::RawTemperature,
        Plane::RemappedTemperature,
        Plane::RawVisible,
        Plane::PictureInPicture,
    ];

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Plane::Fusion | Plane::PictureInPicture => 4,
            Plane::RawIr | Plane::RawTemperature | Plane::RemappedTemperature => 2,
            Plane::RawVisible => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Plane::Fusion => "fusion",
            Plane::RawIr => "raw-ir",
            Plane::RawTemperature => "raw-temperature",
            Plane::RemappedTemperature => "remapped-temperature",
            Plane::RawVisible => "raw-visible",
            Plane::PictureInPicture => "pip-visible",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte range of one plane inside the composite frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneSpan {
    pub offset: usize,
    pub len: usize,
}

impl PlaneSpan {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Plane offsets and total length for one set of resolutions.
///
/// Computing a layout is pure. A layout never adapts to a frame: when any
/// resolution changes, build a new layout and reallocate its
/// [`PlaneBuffers`] before the next frame arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    resolutions: Resolutions,
    spans: [PlaneSpan; 6],
    frame_len: usize,
}

impl FrameLayout {
    pub fn new(resolutions: Resolutions) -> Self {
        let mut spans = [PlaneSpan::default(); 6];
        let mut offset = 0usize;
        for plane in Plane::ALL {
            let len = plane_resolution(&resolutions, plane).pixels() * plane.bytes_per_pixel();
            spans[plane.index()] = PlaneSpan { offset, len };
            offset += len;
        }
        Self {
            resolutions,
            spans,
            frame_len: offset,
        }
    }

    /// Total composite frame length (`FRAME_LEN`).
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn resolutions(&self) -> Resolutions {
        self.resolutions
    }

    pub fn span(&self, plane: Plane) -> PlaneSpan {
        self.spans[plane.index()]
    }

    /// Resolution the plane's pixels are laid out at.
    pub fn plane_resolution(&self, plane: Plane) -> Resolution {
        plane_resolution(&self.resolutions, plane)
    }

    /// Borrow one plane of `frame` without copying.
    pub fn plane<'a>(&self, frame: &'a [u8], plane: Plane) -> Result<&'a [u8], LayoutError> {
        self.check_frame(frame)?;
        Ok(&frame[self.span(plane).range()])
    }

    /// Copy one plane into a freshly sized buffer.
    pub fn extract_plane(&self, frame: &[u8], plane: Plane) -> Result<Vec<u8>, LayoutError> {
        self.plane(frame, plane).map(<[u8]>::to_vec)
    }

    /// Copy one plane into `dest`, which must be exactly the plane's length.
    pub fn extract_plane_into(
        &self,
        frame: &[u8],
        plane: Plane,
        dest: &mut [u8],
    ) -> Result<(), LayoutError> {
        let src = self.plane(frame, plane)?;
        if dest.len() != src.len() {
            return Err(LayoutError::DestinationSize {
                plane,
                expected: src.len(),
                actual: dest.len(),
            });
        }
        dest.copy_from_slice(src);
        Ok(())
    }

    /// Copy all six planes of `frame` into buffers sized for this layout.
    pub fn demux(&self, frame: &[u8], buffers: &mut PlaneBuffers) -> Result<(), LayoutError> {
        if buffers.layout != *self {
            return Err(LayoutError::LayoutMismatch);
        }
        self.check_frame(frame)?;
        for plane in Plane::ALL {
            buffers.planes[plane.index()].copy_from_slice(&frame[self.span(plane).range()]);
        }
        Ok(())
    }

    fn check_frame(&self, frame: &[u8]) -> Result<(), LayoutError> {
        if frame.len() < self.frame_len {
            return Err(LayoutError::OutOfRange {
                required: self.frame_len,
                actual: frame.len(),
            });
        }
        Ok(())
    }
}

fn plane_resolution(resolutions: &Resolutions, plane: Plane) -> Resolution {
    match plane {
        Plane::Fusion | Plane::RemappedTemperature | Plane::PictureInPicture => resolutions.dual,
        Plane::RawIr | Plane::RawTemperature => resolutions.sensor,
        Plane::RawVisible => resolutions.visible,
    }
}

/// Pre-sized destination buffers for every plane of one layout.
///
/// Allocated once per resolution configuration and reused for every frame.
#[derive(Debug, Clone)]
pub struct PlaneBuffers {
    layout: FrameLayout,
    planes: [Vec<u8>; 6],
}

impl PlaneBuffers {
    pub fn new(layout: &FrameLayout) -> Self {
        Self {
            layout: *layout,
            planes: std::array::from_fn(|i| vec![0u8; layout.spans[i].len]),
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn get(&self, plane: Plane) -> &[u8] {
        &self.planes[plane.index()]
    }

    pub fn get_mut(&mut self, plane: Plane) -> &mut [u8] {
        &mut self.planes[plane.index()]
    }

    /// Reallocate every plane for `layout`. The only place buffers change size.
    pub fn reconfigure(&mut self, layout: &FrameLayout) {
        *self = Self::new(layout);
    }
}
