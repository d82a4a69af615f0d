//! Page-space to device-space mapping

use super::types::{DeviceRect, PageRect, PageSize, Rotation};

/// Map a page-space rectangle onto a `width x height` device raster.
///
/// The page is rotated clockwise first, then the rotated page is stretched
/// to fill the raster. The result is normalized so `left <= right` and
/// `top <= bottom`.
#[must_use]
pub fn map_page_rect_to_device(
    page: PageSize,
    rect: PageRect,
    width: u32,
    height: u32,
    rotation: Rotation,
) -> DeviceRect {
    let (ax, ay) = map_point(page, rect.x0, rect.y0, width, height, rotation);
    let (bx, by) = map_point(page, rect.x1, rect.y1, width, height, rotation);

    DeviceRect::new(ax.min(bx), ay.min(by), ax.max(bx), ay.max(by))
}

fn map_point(
    page: PageSize,
    x: f32,
    y: f32,
    width: u32,
    height: u32,
    rotation: Rotation,
) -> (f32, f32) {
    let (pw, ph) = (page.width, page.height);

    let (rx, ry) = match rotation {
        Rotation::None => (x, y),
        Rotation::Clockwise90 => (ph - y, x),
        Rotation::Rotate180 => (pw - x, ph - y),
        Rotation::Clockwise270 => (y, pw - x),
    };
    let (rotated_w, rotated_h) = if rotation.swaps_axes() {
        (ph, pw)
    } else {
        (pw, ph)
    };

    if rotated_w <= 0.0 || rotated_h <= 0.0 {
        return (0.0, 0.0);
    }

    (rx * width as f32 / rotated_w, ry * height as f32 / rotated_h)
}
