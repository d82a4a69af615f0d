//! Core types for PDF page rendering

use super::request::RenderError;

/// Largest width or height accepted for a single page raster
pub const MAX_RENDER_DIMENSION: u32 = 16_384;

/// Handle of a document registered with the render cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub u64);

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

/// Identity of one page raster request.
///
/// Density is kept as its bit pattern so that equality and hashing are
/// bit-exact: `1.0` and `1.0000001` are different keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderKey {
    pub document: DocumentId,
    /// Page number (0-indexed)
    pub page: usize,
    /// Target width in pixels
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
    density_bits: u32,
}

impl RenderKey {
    #[must_use]
    pub fn new(document: DocumentId, page: usize, width: u32, height: u32, density: f32) -> Self {
        Self {
            document,
            page,
            width,
            height,
            density_bits: density.to_bits(),
        }
    }

    /// Pixel density scale factor
    #[must_use]
    pub fn density(&self) -> f32 {
        f32::from_bits(self.density_bits)
    }

    /// Same size and density, different page
    #[must_use]
    pub fn with_page(&self, page: usize) -> Self {
        Self {
            page,
            ..self.clone()
        }
    }

    /// Check the raster dimensions before anything is allocated
    pub fn validate(&self) -> Result<(), RenderError> {
        let density = self.density();
        let size_ok = self.width > 0
            && self.height > 0
            && self.width <= MAX_RENDER_DIMENSION
            && self.height <= MAX_RENDER_DIMENSION;
        if size_ok && density.is_finite() && density > 0.0 {
            Ok(())
        } else {
            Err(RenderError::InvalidRenderDimensions {
                width: self.width,
                height: self.height,
                density,
            })
        }
    }
}

/// Pixel layout of a rendered bitmap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 3 bytes per pixel: R, G, B
    Rgb8,
    /// 4 bytes per pixel: R, G, B, A
    Rgba8,
}

impl PixelFormat {
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb8 => 3,
            Self::Rgba8 => 4,
        }
    }
}

/// Raw raster produced by a document engine
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

impl Bitmap {
    /// Expected buffer length for the bitmap's dimensions
    #[must_use]
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// A rendered page raster, immutable once produced.
///
/// Always exactly `key.width x key.height` pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedPage {
    key: RenderKey,
    bitmap: Bitmap,
}

impl RenderedPage {
    /// Wrap an engine bitmap, rejecting anything that does not match the key
    pub fn from_bitmap(key: RenderKey, bitmap: Bitmap) -> Result<Self, RenderError> {
        if bitmap.width != key.width || bitmap.height != key.height {
            return Err(RenderError::failure(format!(
                "engine produced {}x{} for a {}x{} request",
                bitmap.width, bitmap.height, key.width, key.height
            )));
        }
        if bitmap.pixels.len() != bitmap.expected_len() {
            return Err(RenderError::failure(format!(
                "pixel buffer is {} bytes, expected {}",
                bitmap.pixels.len(),
                bitmap.expected_len()
            )));
        }
        Ok(Self { key, bitmap })
    }

    #[must_use]
    pub fn key(&self) -> &RenderKey {
        &self.key
    }

    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.bitmap.format
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.bitmap.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.bitmap.height
    }

    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.bitmap.pixels
    }

    /// Bytes charged against the cache budget
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.bitmap.pixels.len()
    }
}

/// Page dimensions in engine units (points for PDF)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    #[must_use]
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Rectangle in page space, origin at the page's top-left corner
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageRect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl PageRect {
    #[must_use]
    pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }
}

/// Rectangle in device pixels
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl DeviceRect {
    #[must_use]
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Interior containment; points on an edge are outside
    #[must_use]
    pub fn strictly_contains(&self, point: Point) -> bool {
        self.left < point.x && point.x < self.right && self.top < point.y && point.y < self.bottom
    }
}

/// A tap location in device pixels
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Clockwise page rotation in quarter turns
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Rotate180,
    Clockwise270,
}

impl Rotation {
    /// Normalize any number of quarter turns, negative meaning counter-clockwise
    #[must_use]
    pub fn from_quarter_turns(turns: i32) -> Self {
        match turns.rem_euclid(4) {
            1 => Self::Clockwise90,
            2 => Self::Rotate180,
            3 => Self::Clockwise270,
            _ => Self::None,
        }
    }

    /// Accepts 0, 90, 180 and 270
    #[must_use]
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        if degrees % 90 == 0 {
            Some(Self::from_quarter_turns(degrees / 90))
        } else {
            None
        }
    }

    /// Whether the page's width and height trade places
    #[must_use]
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Clockwise90 | Self::Clockwise270)
    }
}

/// Link annotation as enumerated by the engine, in page space
#[derive(Clone, Debug, PartialEq)]
pub struct PageLink {
    pub uri: Option<String>,
    pub dest_page: Option<usize>,
    pub bounds: PageRect,
}

/// Link target type
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkTarget {
    Internal { page: usize },
    External { uri: String },
}

/// Link rectangle in device pixels
#[derive(Clone, Debug, PartialEq)]
pub struct LinkRect {
    pub target_uri: Option<String>,
    pub destination_page: Option<usize>,
    pub bounds: DeviceRect,
}

impl LinkRect {
    /// Internal destinations win over URIs; empty URIs are no target
    #[must_use]
    pub fn target(&self) -> Option<LinkTarget> {
        if let Some(page) = self.destination_page {
            return Some(LinkTarget::Internal { page });
        }
        self.target_uri
            .as_ref()
            .filter(|uri| !uri.is_empty())
            .map(|uri| LinkTarget::External { uri: uri.clone() })
    }
}
