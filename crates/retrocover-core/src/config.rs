//! Typed run configuration.
//!
//! Loading these from JSON is the caller's job; the core only receives the
//! deserialized values, immutably, one reference per component. `validate()`
//! runs before any compute submission and is the only place a
//! [`Error::Config`] originates.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{Error, Result};

/// A single-band raster asset pinned to a year and a nominal scale (metres).
#[derive(Debug, Clone, Deserialize)]
pub struct AssetRef {
    pub year: u16,
    pub path: String,
    /// Native resolution used for reductions and exports, in metres.
    pub scale: f64,
}

/// Reference + target assets for the harmonization stage.
#[derive(Debug, Clone, Deserialize)]
pub struct HarmonizeAssets {
    pub reference: AssetRef,
    pub targets: Vec<AssetRef>,
}

/// Configuration for the percentile-harmonization stage.
#[derive(Debug, Clone, Deserialize)]
pub struct HarmonizeConfig {
    pub project_id: String,
    pub aoi_asset: String,
    pub export_folder: String,
    pub assets: HarmonizeAssets,
}

impl HarmonizeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.aoi_asset.is_empty() {
            return Err(Error::Config("aoi_asset must not be empty".into()));
        }
        if self.assets.reference.path.is_empty() {
            return Err(Error::Config("assets.reference.path must not be empty".into()));
        }
        if self.assets.targets.is_empty() {
            return Err(Error::Config("assets.targets must list at least one year".into()));
        }
        for t in &self.assets.targets {
            if t.scale <= 0.0 {
                return Err(Error::Config(format!(
                    "assets.targets[{}].scale must be positive, got {}",
                    t.year, t.scale
                )));
            }
        }
        Ok(())
    }
}

/// Classifier and post-processing parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierParams {
    /// Number of land-cover classes; labels run 1..=n_classes.
    pub n_classes: u8,
    pub samples_per_class: u32,
    /// Decision-forest tree count.
    pub rf_trees: u32,
    /// Seed shared by the stratified sampler and the forest trainer.
    pub seed: u64,
    /// Reinforcement floor: fused weight = alpha + prior * (1 - alpha).
    pub prior_alpha: f64,
    /// Minimum mapping unit, in pixels.
    pub min_patch_size: u32,
}

/// Export resolution per sensor era, in metres.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportScales {
    pub tm: f64,
    pub mss: f64,
}

/// Configuration for the classification stage.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyConfig {
    pub project_id: String,
    pub aoi_asset: String,
    pub export_folder: String,
    /// Harmonized index rasters keyed by year. Must include the anchor year;
    /// every other key is a classification target.
    pub ndvi_assets: BTreeMap<u16, String>,
    /// Labeled land-cover maps keyed by epoch year.
    pub corine_assets: BTreeMap<u16, String>,
    pub parameters: ClassifierParams,
    pub export_scales: ExportScales,
}

impl ClassifyConfig {
    pub fn validate(&self) -> Result<()> {
        let p = &self.parameters;
        if p.n_classes == 0 || p.n_classes > 99 {
            return Err(Error::Config(format!(
                "parameters.n_classes must be in 1..=99, got {}",
                p.n_classes
            )));
        }
        if p.samples_per_class == 0 {
            return Err(Error::Config("parameters.samples_per_class must be positive".into()));
        }
        if p.rf_trees == 0 {
            return Err(Error::Config("parameters.rf_trees must be positive".into()));
        }
        if !(0.0..=1.0).contains(&p.prior_alpha) {
            return Err(Error::Config(format!(
                "parameters.prior_alpha must be in [0, 1], got {}",
                p.prior_alpha
            )));
        }
        if p.min_patch_size == 0 {
            return Err(Error::Config("parameters.min_patch_size must be at least 1".into()));
        }
        if !self.ndvi_assets.contains_key(&crate::prior::ANCHOR_YEAR) {
            return Err(Error::Config(format!(
                "ndvi_assets must include the anchor year {}",
                crate::prior::ANCHOR_YEAR
            )));
        }
        for year in crate::prior::EPOCH_YEARS {
            if !self.corine_assets.contains_key(&year) {
                return Err(Error::Config(format!(
                    "corine_assets must include epoch year {year}"
                )));
            }
        }
        if self.export_scales.tm <= 0.0 || self.export_scales.mss <= 0.0 {
            return Err(Error::Config("export_scales must be positive".into()));
        }
        Ok(())
    }

    /// Years to classify: every NDVI year except the anchor, ascending.
    pub fn target_years(&self) -> Vec<u16> {
        self.ndvi_assets
            .keys()
            .copied()
            .filter(|&y| y != crate::prior::ANCHOR_YEAR)
            .collect()
    }
}

/// A (from_year, to_year) pair, deserialized from a two-element array.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct YearPair(pub u16, pub u16);

/// Configuration for the transition-statistics stage.
#[derive(Debug, Clone, Deserialize)]
pub struct TransitionConfig {
    pub project_id: String,
    pub aoi_asset: String,
    pub export_folder: String,
    /// Categorical land-cover rasters keyed by year.
    pub assets: BTreeMap<u16, String>,
    pub pairs: Vec<YearPair>,
    pub n_classes: u8,
    /// Reduction scale for histograms and QC counts, in metres.
    pub scale: f64,
}

impl TransitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_classes == 0 || self.n_classes > 99 {
            return Err(Error::Config(format!(
                "n_classes must be in 1..=99, got {}",
                self.n_classes
            )));
        }
        if self.scale <= 0.0 {
            return Err(Error::Config(format!("scale must be positive, got {}", self.scale)));
        }
        if self.pairs.is_empty() {
            return Err(Error::Config("pairs must list at least one year pair".into()));
        }
        for &YearPair(y1, y2) in &self.pairs {
            for y in [y1, y2] {
                if !self.assets.contains_key(&y) {
                    return Err(Error::Config(format!(
                        "pair ({y1}, {y2}) references year {y} missing from assets"
                    )));
                }
            }
        }
        Ok(())
    }
}
