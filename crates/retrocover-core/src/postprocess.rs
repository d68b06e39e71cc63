//! Morphological cleanup of classified label maps.
//!
//! Two 3x3 focal-mode passes bracket a minimum-mapping-unit step: pixels in
//! same-value components smaller than the configured patch size are masked
//! and immediately backfilled with the mode-filtered value. Small patches
//! are smoothed into their surroundings, never deleted, so the output
//! covers every pixel the input covers.

use crate::raster::Image;

/// Focal-mode window radius; 1 gives the 3x3 square neighborhood.
pub const MODE_RADIUS: u32 = 1;

/// Component-size counting cap. Sizes at or above this saturate; the
/// minimum patch size must stay below it for the mask test to be exact.
pub const MAX_COUNTED_SIZE: u32 = 100;

/// Apply mode smoothing and the minimum-mapping-unit rule. Pure graph
/// building.
pub fn post_process(label: &Image, min_patch_size: u32) -> Image {
    let smoothed = label.focal_mode(MODE_RADIUS);
    let component_size = smoothed.connected_pixel_count(MAX_COUNTED_SIZE, true);
    let keep = component_size.gte(f64::from(min_patch_size));
    smoothed
        .update_mask(&keep)
        .unmask(&smoothed)
        .focal_mode(MODE_RADIUS)
}
