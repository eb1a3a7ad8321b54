//! Pixel geometry for pages and tiles
//!
//! Requests above the maximum dimension are never downsampled silently; the
//! caller gets a [`SizeSuggestion`] obtained by scaling the request linearly
//! back to the cap.

use crate::error::SizeSuggestion;
use quire_engine::{ClipRect, PageSize};

const MAX_BACKOFF_STEPS: usize = 16;

/// A whole page at a target width
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PagePlan {
    pub width: u32,
    pub height: u32,
    /// Pixels per point
    pub scale: f32,
}

/// A page region at a scale, clamped to the page
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilePlan {
    /// Clamped region in points, aligned to whole pixels
    pub clip: ClipRect,
    pub width: u32,
    pub height: u32,
    pub scale: f32,
    /// Pixel origin of the region on the full page
    pub origin_px: (u32, u32),
}

/// Pixel height of the page when rendered `width` pixels wide
pub fn page_height_for_width(size: PageSize, width: u32) -> u32 {
    let aspect = f64::from(size.height_pt) / f64::from(size.width_pt);
    let aspect = if aspect.is_finite() && aspect > 0.0 { aspect } else { 1.0 };
    ((f64::from(width) * aspect).round() as u32).max(1)
}

pub fn plan_page(size: PageSize, width: u32, max_dimension: u32) -> Result<PagePlan, SizeSuggestion> {
    let width = width.max(1);
    let height = page_height_for_width(size, width);
    if width <= max_dimension && height <= max_dimension {
        return Ok(PagePlan {
            width,
            height,
            scale: width as f32 / size.width_pt,
        });
    }

    let largest = u64::from(width.max(height));
    let mut suggested = ((u64::from(width) * u64::from(max_dimension)) / largest).max(1) as u32;
    while suggested > 1
        && (suggested > max_dimension || page_height_for_width(size, suggested) > max_dimension)
    {
        suggested -= 1;
    }

    Err(SizeSuggestion::Width {
        requested: width,
        suggested: suggested.min(width.saturating_sub(1)).max(1),
    })
}

/// What must fit within the maximum dimension for a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileRaster {
    /// The engine rasterises only the clip
    Clip,
    /// The engine rasterises the whole page at the tile's scale
    WholePage,
}

/// Clamp `rect` to the page (never below one pixel each way) and size it at `scale`
///
/// A scale that is not a positive finite number is treated as 1.
pub fn plan_tile(
    size: PageSize,
    rect: ClipRect,
    scale: f32,
    max_dimension: u32,
    raster: TileRaster,
) -> Result<TilePlan, SizeSuggestion> {
    let scale = if scale.is_finite() && scale > 0.0 {
        scale
    } else {
        1.0
    };

    let extent = |plan: &TilePlan| match raster {
        TileRaster::Clip => plan.width.max(plan.height),
        TileRaster::WholePage => {
            let (width, height) = page_pixels(size, plan.scale);
            width.max(height)
        }
    };

    let plan = clamp_tile(size, rect, scale);
    if extent(&plan) <= max_dimension {
        return Ok(plan);
    }

    let mut suggested = scale;
    let mut current = plan;
    for _ in 0..MAX_BACKOFF_STEPS {
        suggested *= max_dimension as f32 / extent(&current) as f32;
        current = clamp_tile(size, rect, suggested);
        if extent(&current) <= max_dimension {
            break;
        }
    }
    if suggested >= scale {
        suggested = next_down(scale);
    }

    Err(SizeSuggestion::Scale {
        requested: scale,
        suggested,
    })
}

/// Pixel size of the whole page at `scale`
fn page_pixels(size: PageSize, scale: f32) -> (u32, u32) {
    let scale = f64::from(scale);
    (
        (f64::from(size.width_pt) * scale).round().max(1.0) as u32,
        (f64::from(size.height_pt) * scale).round().max(1.0) as u32,
    )
}

fn clamp_tile(size: PageSize, rect: ClipRect, scale: f32) -> TilePlan {
    let scale64 = f64::from(scale);
    let (page_w, page_h) = page_pixels(size, scale);
    let (page_w, page_h) = (f64::from(page_w), f64::from(page_h));

    let finite = |value: f32| if value.is_finite() { f64::from(value) } else { 0.0 };
    let span = |start: f32, extent: f32, limit: f64| {
        let start = finite(start);
        let end = start + finite(extent).max(0.0);
        let p0 = (start * scale64).floor().clamp(0.0, limit - 1.0);
        let p1 = (end * scale64).ceil().clamp(p0 + 1.0, limit);
        (p0, p1)
    };

    let (x0, x1) = span(rect.x, rect.width, page_w);
    let (y0, y1) = span(rect.y, rect.height, page_h);

    TilePlan {
        clip: ClipRect {
            x: (x0 / scale64) as f32,
            y: (y0 / scale64) as f32,
            width: ((x1 - x0) / scale64) as f32,
            height: ((y1 - y0) / scale64) as f32,
        },
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
        scale,
        origin_px: (x0 as u32, y0 as u32),
    }
}

/// Largest float strictly below a positive `value`
fn next_down(value: f32) -> f32 {
    if value > 0.0 {
        f32::from_bits(value.to_bits() - 1)
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LETTER: PageSize = PageSize::LETTER;

    fn rect(x: f32, y: f32, width: f32, height: f32) -> ClipRect {
        ClipRect {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn test_page_keeps_aspect_ratio() {
        let plan = plan_page(LETTER, 1080, 8192).unwrap();
        assert_eq!(plan.width, 1080);
        assert_eq!(plan.height, 1398);
        assert!((plan.scale - 1080.0 / 612.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_width_is_one_pixel() {
        let plan = plan_page(LETTER, 0, 8192).unwrap();
        assert_eq!(plan.width, 1);
        assert_eq!(plan.height, 1);
    }

    #[test]
    fn test_oversized_page_suggests_smaller_width() {
        let err = plan_page(LETTER, 2000, 1000).unwrap_err();
        let SizeSuggestion::Width {
            requested,
            suggested,
        } = err
        else {
            panic!("expected a width suggestion");
        };

        assert_eq!(requested, 2000);
        assert!(suggested < requested);
        assert!(plan_page(LETTER, suggested, 1000).is_ok());
    }

    #[test]
    fn test_tile_inside_page() {
        let plan =
            plan_tile(LETTER, rect(100.0, 200.0, 50.0, 25.0), 2.0, 8192, TileRaster::Clip).unwrap();
        assert_eq!((plan.width, plan.height), (100, 50));
        assert_eq!(plan.origin_px, (200, 400));
        assert_eq!(plan.clip, rect(100.0, 200.0, 50.0, 25.0));
    }

    #[test]
    fn test_tile_partially_outside_is_clamped() {
        let region = rect(-50.0, 700.0, 200.0, 500.0);
        let plan = plan_tile(LETTER, region, 1.0, 8192, TileRaster::Clip).unwrap();
        assert_eq!(plan.clip.x, 0.0);
        assert_eq!(plan.width, 150);
        assert_eq!(plan.height, 92);
    }

    #[test]
    fn test_tile_fully_outside_is_one_pixel() {
        let region = rect(5000.0, 5000.0, 10.0, 10.0);
        let plan = plan_tile(LETTER, region, 1.0, 8192, TileRaster::Clip).unwrap();
        assert_eq!((plan.width, plan.height), (1, 1));
        assert_eq!(plan.origin_px, (611, 791));
    }

    #[test]
    fn test_oversized_tile_suggests_smaller_scale() {
        let page = rect(0.0, 0.0, 612.0, 792.0);
        let err = plan_tile(LETTER, page, 20.0, 4096, TileRaster::Clip).unwrap_err();
        let SizeSuggestion::Scale {
            requested,
            suggested,
        } = err
        else {
            panic!("expected a scale suggestion");
        };

        assert_eq!(requested, 20.0);
        assert!(suggested < requested);
        assert!(plan_tile(LETTER, page, suggested, 4096, TileRaster::Clip).is_ok());
    }

    #[test]
    fn test_whole_page_raster_bounds_small_tiles() {
        // 256 px tile of a page that is 4896 x 6336 px at this scale
        let tile = rect(0.0, 0.0, 32.0, 32.0);
        let plan = plan_tile(LETTER, tile, 8.0, 2048, TileRaster::Clip).unwrap();
        assert_eq!((plan.width, plan.height), (256, 256));

        let err = plan_tile(LETTER, tile, 8.0, 2048, TileRaster::WholePage).unwrap_err();
        let SizeSuggestion::Scale { suggested, .. } = err else {
            panic!("expected a scale suggestion");
        };
        assert!(plan_tile(LETTER, tile, suggested, 2048, TileRaster::WholePage).is_ok());
    }

    proptest! {
        #[test]
        fn tiles_always_land_on_the_page(
            x in -2000.0f32..2000.0,
            y in -2000.0f32..2000.0,
            width in -10.0f32..3000.0,
            height in -10.0f32..3000.0,
            scale in 0.05f32..6.0,
        ) {
            let region = rect(x, y, width, height);
            let plan = plan_tile(LETTER, region, scale, u32::MAX, TileRaster::Clip).unwrap();
            let page_w = (612.0 * f64::from(scale)).round().max(1.0) as u32;
            let page_h = (792.0 * f64::from(scale)).round().max(1.0) as u32;

            prop_assert!(plan.width >= 1 && plan.height >= 1);
            prop_assert!(plan.origin_px.0 + plan.width <= page_w);
            prop_assert!(plan.origin_px.1 + plan.height <= page_h);
        }
    }
}
