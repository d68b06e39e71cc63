//! Percentile-based harmonization of vegetation-index rasters.
//!
//! Cross-sensor NDVI series drift in range; mapping each year's robust
//! P2–P98 span onto the reference year's span aligns the distributions
//! without trusting the extreme tails.

use crate::error::{Error, Result};
use crate::raster::{Aoi, Image};
use crate::service::{RasterComputeService, ReduceOpts, Reducer};

/// Hard bounds of a normalized-difference index.
pub const INDEX_MIN: f64 = -1.0;
pub const INDEX_MAX: f64 = 1.0;

/// Minimum allowed P2–P98 span; a narrower span is widened to this so the
/// mapping never divides by (near) zero.
pub const PERCENTILE_EPS: f64 = 1e-6;

/// The robust value span of one raster over the region of interest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentileRange {
    pub p2: f64,
    pub p98: f64,
}

impl PercentileRange {
    /// Floors `p98` to `p2 + PERCENTILE_EPS` so [`span`](Self::span) is
    /// always positive.
    pub fn new(p2: f64, p98: f64) -> Self {
        Self { p2, p98: p98.max(p2 + PERCENTILE_EPS) }
    }

    #[inline]
    pub fn span(&self) -> f64 {
        self.p98 - self.p2
    }
}

/// Reduce one band of `image` to its P2–P98 range over `region`. Blocks on
/// the compute service.
pub fn percentile_range(
    svc: &dyn RasterComputeService,
    image: &Image,
    band: &str,
    region: &Aoi,
    scale: f64,
) -> Result<PercentileRange> {
    let stats = svc.reduce_region(
        image,
        &Reducer::Percentiles(vec![2, 98]),
        region,
        &ReduceOpts::at_scale(scale),
    )?;
    let key_lo = format!("{band}_p2");
    let key_hi = format!("{band}_p98");
    let p2 = *stats
        .get(&key_lo)
        .ok_or_else(|| Error::Compute(format!("missing percentile {key_lo:?} in {stats:?}")))?;
    let p98 = *stats
        .get(&key_hi)
        .ok_or_else(|| Error::Compute(format!("missing percentile {key_hi:?} in {stats:?}")))?;
    Ok(PercentileRange::new(p2, p98))
}

/// Map `target`'s P2–P98 span linearly onto the reference span, clamp to the
/// reference span and then to the valid index range, and name the result
/// `NDVI`. Pure graph building.
pub fn harmonize(target: &Image, t: PercentileRange, r: PercentileRange) -> Image {
    target
        .subtract(t.p2)
        .divide(t.span())
        .multiply(r.span())
        .add(r.p2)
        .clamp(r.p2, r.p98)
        .clamp(INDEX_MIN, INDEX_MAX)
        .rename(["NDVI"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::grid::Grid;
    use crate::engine::{GridGeometry, LocalEngine};
    use approx::assert_relative_eq;

    fn engine_with_values(values: Vec<f64>, width: usize, height: usize) -> LocalEngine {
        let geometry = GridGeometry::new(width, height, Aoi::new(20.0, 21.0, 38.0, 39.0));
        let mut engine = LocalEngine::new(geometry);
        engine.insert_band("demo/target", "NDVI", Grid::from_values(width, height, values));
        engine
    }

    #[test]
    fn maps_target_span_onto_reference_span() {
        // Five pixels spanning 0..0.8 mapped onto a 0.1..0.6 reference span.
        let mut values = vec![0.0, 0.2, 0.4, 0.6, 0.8];
        values.push(0.4); // pad to fill the 3x2 grid
        let engine = engine_with_values(values, 3, 2);

        let mapped = harmonize(
            &Image::source("demo/target"),
            PercentileRange::new(0.0, 0.8),
            PercentileRange::new(0.1, 0.6),
        );
        let stack = engine.evaluate(&mapped).unwrap();
        assert_eq!(stack.band_names(), vec!["NDVI"]);

        let out = stack.band("NDVI").unwrap();
        let expected = [0.1, 0.225, 0.35, 0.475, 0.6];
        for (i, want) in expected.iter().enumerate() {
            let got = out.get(i / 3, i % 3);
            assert_relative_eq!(got, *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn output_is_clamped_to_the_reference_span() {
        // An outlier beyond the target p98 must land exactly on ref p98.
        let engine = engine_with_values(vec![0.95, 0.0, 0.4, 0.4], 2, 2);
        let mapped = harmonize(
            &Image::source("demo/target"),
            PercentileRange::new(0.0, 0.8),
            PercentileRange::new(0.1, 0.6),
        );
        let out = engine.evaluate(&mapped).unwrap();
        assert_relative_eq!(out.band("NDVI").unwrap().get(0, 0), 0.6, epsilon = 1e-12);
    }

    #[test]
    fn degenerate_range_is_floored_not_divided_by_zero() {
        let r = PercentileRange::new(0.3, 0.3);
        assert!(r.span() >= PERCENTILE_EPS);
        let r = PercentileRange::new(0.5, 0.2);
        assert!(r.span() >= PERCENTILE_EPS, "inverted input must still be positive");
    }

    #[test]
    fn percentile_range_reads_service_stat_keys() {
        let engine = engine_with_values((0..100).map(|i| i as f64 / 99.0).collect(), 10, 10);
        let range = percentile_range(
            &engine,
            &Image::source("demo/target"),
            "NDVI",
            &engine.full_region(),
            60.0,
        )
        .unwrap();
        assert!(range.p2 < range.p98);
        assert_relative_eq!(range.p2, 0.02, epsilon = 0.01);
        assert_relative_eq!(range.p98, 0.98, epsilon = 0.01);
    }
}
