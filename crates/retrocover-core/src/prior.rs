//! Temporally-weighted land-cover prior.
//!
//! Labeled maps exist at five fixed epochs. Per class, the prior is a
//! weighted blend of class-indicator images, weighting the anchor epoch
//! heaviest and the most distant pair lightest. The blend is intentionally
//! not normalized: downstream fusion multiplies it into class probabilities
//! before an argmax, so only relative magnitudes matter.

use crate::config::ClassifyConfig;
use crate::error::{Error, Result};
use crate::raster::{Aoi, Image};

/// The epoch the classifier is trained on.
pub const ANCHOR_YEAR: u16 = 1990;
pub const MID_YEARS: [u16; 2] = [2000, 2006];
pub const FAR_YEARS: [u16; 2] = [2012, 2018];

/// Every labeled epoch, ascending.
pub const EPOCH_YEARS: [u16; 5] = [1990, 2000, 2006, 2012, 2018];

pub const W_ANCHOR: f64 = 0.7;
pub const W_MID: f64 = 0.2;
pub const W_FAR: f64 = 0.1;

/// Prior band name for a class.
pub fn class_band(class: u8) -> String {
    format!("p{class}")
}

/// The epoch label images the prior blends.
#[derive(Debug, Clone)]
pub struct PriorEpochs {
    anchor: Image,
    mid: Vec<Image>,
    far: Vec<Image>,
}

impl PriorEpochs {
    pub fn new(anchor: Image, mid: Vec<Image>, far: Vec<Image>) -> Self {
        Self { anchor, mid, far }
    }

    /// Load all five epochs from the configured label assets.
    pub fn from_config(cfg: &ClassifyConfig, aoi: &Aoi) -> Result<Self> {
        let load = |year: u16| -> Result<Image> {
            let asset = cfg.corine_assets.get(&year).ok_or_else(|| {
                Error::Config(format!("no land-cover asset for epoch year {year}"))
            })?;
            Ok(Image::source(asset).select_index(0).to_int().clip(aoi))
        };
        Ok(Self {
            anchor: load(ANCHOR_YEAR)?,
            mid: MID_YEARS.iter().map(|&y| load(y)).collect::<Result<_>>()?,
            far: FAR_YEARS.iter().map(|&y| load(y)).collect::<Result<_>>()?,
        })
    }
}

/// Mean of per-epoch class indicators. Addition commutes, so the epoch
/// order within a group never changes the result.
fn indicator_mean(epochs: &[Image], class: f64) -> Image {
    let mut sum = Image::constant(0.0);
    for epoch in epochs {
        sum = sum.add(&epoch.eq(class).to_float());
    }
    sum.divide(epochs.len().max(1) as f64)
}

/// Build the prior: one band `p<c>` per class c in 1..=n_classes, each
/// `0.7 * I(anchor = c) + 0.2 * avg(mid) + 0.1 * avg(far)`. Pure graph
/// building.
pub fn temporal_prior(epochs: &PriorEpochs, n_classes: u8) -> Image {
    let bands: Vec<Image> = (1..=n_classes)
        .map(|c| {
            let class = f64::from(c);
            epochs
                .anchor
                .eq(class)
                .to_float()
                .multiply(W_ANCHOR)
                .add(&indicator_mean(&epochs.mid, class).multiply(W_MID))
                .add(&indicator_mean(&epochs.far, class).multiply(W_FAR))
                .rename([class_band(c)])
        })
        .collect();
    Image::cat(&bands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::grid::Grid;
    use crate::engine::{GridGeometry, LocalEngine};
    use approx::assert_relative_eq;

    /// Engine with one-pixel-per-cell epoch labels:
    /// pixel 0 is class 1 in every epoch; pixel 1 is 1/2/2/3/3.
    fn epoch_engine() -> LocalEngine {
        let geometry = GridGeometry::new(2, 1, Aoi::new(20.0, 21.0, 38.0, 39.0));
        let mut engine = LocalEngine::new(geometry);
        let labels = [
            (1990, vec![1.0, 1.0]),
            (2000, vec![1.0, 2.0]),
            (2006, vec![1.0, 2.0]),
            (2012, vec![1.0, 3.0]),
            (2018, vec![1.0, 3.0]),
        ];
        for (year, values) in labels {
            engine.insert_band(
                format!("demo/clc_{year}"),
                "landcover",
                Grid::from_values(2, 1, values),
            );
        }
        engine
    }

    fn epochs(aoi: &Aoi) -> PriorEpochs {
        let load =
            |year: u16| Image::source(format!("demo/clc_{year}")).to_int().clip(aoi);
        PriorEpochs::new(
            load(1990),
            MID_YEARS.iter().map(|&y| load(y)).collect(),
            FAR_YEARS.iter().map(|&y| load(y)).collect(),
        )
    }

    #[test]
    fn stable_pixel_accumulates_all_weights() {
        let engine = epoch_engine();
        let aoi = engine.full_region();
        let prior = temporal_prior(&epochs(&aoi), 3);
        let out = engine.evaluate(&prior).unwrap();
        assert_eq!(out.band_names(), vec!["p1", "p2", "p3"]);
        assert_relative_eq!(out.band("p1").unwrap().get(0, 0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(out.band("p2").unwrap().get(0, 0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn changing_pixel_splits_weight_by_epoch_group() {
        let engine = epoch_engine();
        let aoi = engine.full_region();
        let out = engine.evaluate(&temporal_prior(&epochs(&aoi), 3)).unwrap();
        // Pixel 1: anchor class 1, both mid epochs class 2, both far class 3.
        assert_relative_eq!(out.band("p1").unwrap().get(0, 1), W_ANCHOR, epsilon = 1e-12);
        assert_relative_eq!(out.band("p2").unwrap().get(0, 1), W_MID, epsilon = 1e-12);
        assert_relative_eq!(out.band("p3").unwrap().get(0, 1), W_FAR, epsilon = 1e-12);
    }

    #[test]
    fn epoch_order_within_a_group_does_not_matter() {
        let engine = epoch_engine();
        let aoi = engine.full_region();
        let load =
            |year: u16| Image::source(format!("demo/clc_{year}")).to_int().clip(&aoi);

        let forward = PriorEpochs::new(
            load(1990),
            vec![load(2000), load(2006)],
            vec![load(2012), load(2018)],
        );
        let reversed = PriorEpochs::new(
            load(1990),
            vec![load(2006), load(2000)],
            vec![load(2018), load(2012)],
        );
        let a = engine.evaluate(&temporal_prior(&forward, 3)).unwrap();
        let b = engine.evaluate(&temporal_prior(&reversed, 3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn from_config_requires_every_epoch_asset() {
        let mut cfg: crate::config::ClassifyConfig = serde_json::from_str(
            r#"{
                "project_id": "demo",
                "aoi_asset": "demo/aoi",
                "export_folder": "exports",
                "ndvi_assets": { "1990": "demo/ndvi_1990" },
                "corine_assets": {
                    "1990": "demo/clc_1990",
                    "2000": "demo/clc_2000",
                    "2006": "demo/clc_2006",
                    "2012": "demo/clc_2012",
                    "2018": "demo/clc_2018"
                },
                "parameters": {
                    "n_classes": 3, "samples_per_class": 10, "rf_trees": 5,
                    "seed": 1, "prior_alpha": 0.5, "min_patch_size": 2
                },
                "export_scales": { "tm": 30.0, "mss": 60.0 }
            }"#,
        )
        .unwrap();
        let aoi = Aoi::new(20.0, 21.0, 38.0, 39.0);
        assert!(PriorEpochs::from_config(&cfg, &aoi).is_ok());

        cfg.corine_assets.remove(&2012);
        let err = PriorEpochs::from_config(&cfg, &aoi).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }
}
