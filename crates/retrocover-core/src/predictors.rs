//! Predictor stack assembly for per-year classification.
//!
//! Every classified year uses the same six predictors, in a fixed band
//! order: the harmonized index, its anchor-year z-score, elevation, slope,
//! and pixel latitude/longitude. Terrain and location are year-invariant;
//! only the two index bands change between years.

use crate::config::ClassifyConfig;
use crate::error::{Error, Result};
use crate::raster::{Aoi, Image};
use crate::service::{RasterComputeService, ReduceOpts, Reducer};

pub const BAND_NDVI: &str = "NDVI";
pub const BAND_Z90: &str = "NDVI_z90";
pub const BAND_ELEV: &str = "elev";
pub const BAND_SLOPE: &str = "slope";
pub const BAND_LAT: &str = "lat";
pub const BAND_LON: &str = "lon";
pub const BAND_LABEL: &str = "lc";

/// Global 30 m digital elevation model.
pub const DEM_ASSET: &str = "USGS/SRTMGL1_003";

/// Predictor bands in training order.
pub const FEATURE_BANDS: [&str; 6] =
    [BAND_NDVI, BAND_Z90, BAND_ELEV, BAND_SLOPE, BAND_LAT, BAND_LON];

/// Floor applied to the anchor standard deviation so z-scores stay finite
/// over near-constant regions.
pub const STD_FLOOR: f64 = 1e-6;

/// Resolution for the anchor-year statistics reduction, in metres.
pub const ANCHOR_STATS_SCALE: f64 = 120.0;

/// First-band loader: single float band named `name`, clipped to the region.
pub fn load_single_band(asset: &str, name: &str, aoi: &Aoi) -> Image {
    Image::source(asset).select_index(0).to_float().rename([name]).clip(aoi)
}

/// Anchor-year index distribution, shared by every classified year.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorStats {
    pub mean: f64,
    pub std: f64,
}

/// Reduce the anchor index to its regional mean and (floored) standard
/// deviation. Blocks on the compute service.
pub fn anchor_statistics(
    svc: &dyn RasterComputeService,
    anchor: &Image,
    region: &Aoi,
) -> Result<AnchorStats> {
    let stats = svc.reduce_region(
        anchor,
        &Reducer::MeanStdDev,
        region,
        &ReduceOpts::at_scale(ANCHOR_STATS_SCALE),
    )?;
    let mean_key = format!("{BAND_NDVI}_mean");
    let std_key = format!("{BAND_NDVI}_stdDev");
    let mean = *stats
        .get(&mean_key)
        .ok_or_else(|| Error::Compute(format!("missing {mean_key:?} in {stats:?}")))?;
    let std = *stats
        .get(&std_key)
        .ok_or_else(|| Error::Compute(format!("missing {std_key:?} in {stats:?}")))?;
    Ok(AnchorStats { mean, std: std.max(STD_FLOOR) })
}

/// Build the six-band predictor stack for one year. Pure graph building;
/// fails only when the year has no registered index asset.
pub fn predictor_stack(
    cfg: &ClassifyConfig,
    year: u16,
    aoi: &Aoi,
    stats: AnchorStats,
) -> Result<Image> {
    let asset = cfg
        .ndvi_assets
        .get(&year)
        .ok_or_else(|| Error::Config(format!("no harmonized index asset for year {year}")))?;

    let ndvi = load_single_band(asset, BAND_NDVI, aoi);
    let z90 = ndvi.subtract(stats.mean).divide(stats.std).rename([BAND_Z90]);
    let elev = load_single_band(DEM_ASSET, BAND_ELEV, aoi);
    let slope = elev.slope().rename([BAND_SLOPE]);
    let coords = Image::pixel_lon_lat()
        .select_names(["latitude", "longitude"])
        .rename([BAND_LAT, BAND_LON])
        .clip(aoi);

    Ok(Image::cat(&[ndvi, z90, elev, slope]).add_bands(&coords))
}
