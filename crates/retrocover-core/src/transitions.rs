//! Land-cover transition statistics and plausibility QC.
//!
//! Each (from_year, to_year) pair yields a transition raster coded
//! `100 * from + to`, a full frequency histogram of the observed codes, and
//! a quality check counting ecologically implausible changes against all
//! valid pixels.

use std::fmt;
use std::io;

use serde::Serialize;

use crate::error::Result;
use crate::raster::{Aoi, Image};
use crate::service::{RasterComputeService, ReduceOpts, Reducer};

pub const CLASS_ARTIFICIAL: u8 = 1;
pub const FOREST_MIN: u8 = 3;
pub const FOREST_MAX: u8 = 5;
pub const CLASS_WETLAND: u8 = 6;

pub const BAND_TRANSITION: &str = "transition";

/// One observed transition code with its pixel count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub transition_code: u32,
    pub pixel_count: u64,
    pub from_year: u16,
    pub to_year: u16,
}

/// `100 * from + to`; invertible for class ids below 100.
#[inline]
pub fn encode_transition(from: u8, to: u8) -> u32 {
    u32::from(from) * 100 + u32::from(to)
}

#[inline]
pub fn decode_transition(code: u32) -> (u8, u8) {
    ((code / 100) as u8, (code % 100) as u8)
}

/// Load a categorical land-cover raster, masking labels outside 1..=n.
pub fn load_landcover(asset: &str, n_classes: u8, aoi: &Aoi) -> Image {
    let labels = Image::source(asset).select_index(0).to_int();
    let in_range = labels.gte(1.0).and(&labels.lte(f64::from(n_classes)));
    labels.update_mask(&in_range).clip(aoi)
}

/// Pairwise transition raster, band `transition`. Pure graph building.
pub fn transition_image(from: &Image, to: &Image) -> Image {
    from.multiply(100.0).add(to).rename([BAND_TRANSITION])
}

/// Full frequency histogram of the transition raster over the region,
/// one record per observed code. Blocks on the compute service; this is
/// the heaviest reduction in the stage.
pub fn transition_histogram(
    svc: &dyn RasterComputeService,
    transition: &Image,
    region: &Aoi,
    scale: f64,
    from_year: u16,
    to_year: u16,
) -> Result<Vec<TransitionRecord>> {
    let hist = svc.frequency_histogram(
        transition,
        BAND_TRANSITION,
        region,
        &ReduceOpts::at_scale(scale),
    )?;
    Ok(hist
        .into_iter()
        .map(|(code, count)| TransitionRecord {
            transition_code: code as u32,
            pixel_count: count,
            from_year,
            to_year,
        })
        .collect())
}

/// 0/1 mask of ecologically implausible changes:
/// forest (3..=5) to artificial, wetland to artificial and back, and
/// wetland to forest. Valid only where both inputs are valid.
pub fn implausible_mask(from: &Image, to: &Image) -> Image {
    let forest_from = from.gte(f64::from(FOREST_MIN)).and(&from.lte(f64::from(FOREST_MAX)));
    let forest_to = to.gte(f64::from(FOREST_MIN)).and(&to.lte(f64::from(FOREST_MAX)));
    let artificial_to = to.eq(f64::from(CLASS_ARTIFICIAL));

    forest_from
        .and(&artificial_to)
        .or(&from.eq(f64::from(CLASS_WETLAND)).and(&artificial_to))
        .or(&from.eq(f64::from(CLASS_ARTIFICIAL)).and(&to.eq(f64::from(CLASS_WETLAND))))
        .or(&from.eq(f64::from(CLASS_WETLAND)).and(&forest_to))
}

/// Result of the plausibility check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QcOutcome {
    Ratio { implausible: u64, total: u64, percent: f64 },
    /// The region held no valid pixel pair at all.
    NoData,
}

impl fmt::Display for QcOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QcOutcome::Ratio { percent, .. } => {
                write!(f, "Improbable transitions = {percent:.3}%")
            }
            QcOutcome::NoData => write!(f, "No data found."),
        }
    }
}

/// Count implausible changes against the from-year raster's valid pixels.
/// Two blocking reductions; an empty region is a [`QcOutcome::NoData`]
/// outcome, never a division by zero. The denominator deliberately ignores
/// the to-year mask: a pixel that was mapped in the from year counts as
/// observed even when the to year has no data there.
pub fn check_implausible(
    svc: &dyn RasterComputeService,
    from: &Image,
    to: &Image,
    region: &Aoi,
    scale: f64,
) -> Result<QcOutcome> {
    let mask = implausible_mask(from, to);
    let opts = ReduceOpts::at_scale(scale);

    let sums =
        svc.reduce_region(&mask.rename(["implausible"]), &Reducer::Sum, region, &opts)?;
    let counts =
        svc.reduce_region(&from.rename(["valid"]), &Reducer::Count, region, &opts)?;

    let implausible = sums.get("implausible").copied().unwrap_or(0.0).round() as u64;
    let total = counts.get("valid").copied().unwrap_or(0.0).round() as u64;
    if total == 0 {
        return Ok(QcOutcome::NoData);
    }
    Ok(QcOutcome::Ratio {
        implausible,
        total,
        percent: implausible as f64 / total as f64 * 100.0,
    })
}

/// Serialize records as CSV with a
/// `transition_code,pixel_count,from_year,to_year` header.
pub fn write_transition_csv<W: io::Write>(
    writer: W,
    records: &[TransitionRecord],
) -> Result<()> {
    let mut w = csv::Writer::from_writer(writer);
    for record in records {
        w.serialize(record)?;
    }
    w.flush()?;
    Ok(())
}
