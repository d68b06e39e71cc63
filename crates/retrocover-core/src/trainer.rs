//! Anchor-year classifier training.
//!
//! The model is trained once per run: a stratified sample of the anchor
//! year's predictor stack against the anchor epoch's labels, fed to the
//! compute service's decision-forest trainer. The returned model may have
//! learned fewer classes than configured when a class has no valid pixels
//! in the sample.

use crate::config::ClassifyConfig;
use crate::error::{Error, Result};
use crate::predictors::{predictor_stack, AnchorStats, BAND_LABEL, FEATURE_BANDS};
use crate::prior::ANCHOR_YEAR;
use crate::raster::{Aoi, Image};
use crate::service::{ForestSpec, RasterComputeService, StratifiedSampleSpec, TrainedModel};

/// Stratified-sampling resolution in metres.
pub const SAMPLE_SCALE: f64 = 60.0;

/// Remote aggregation-tile multiplier for the sampling request.
pub const SAMPLE_TILE_SCALE: u32 = 8;

/// Sample the anchor year and train the decision forest. Blocks on the
/// compute service twice: once to sample, once to train.
pub fn train_classifier(
    svc: &dyn RasterComputeService,
    cfg: &ClassifyConfig,
    aoi: &Aoi,
    stats: AnchorStats,
) -> Result<TrainedModel> {
    let stack = predictor_stack(cfg, ANCHOR_YEAR, aoi, stats)?;
    let label_asset = cfg.corine_assets.get(&ANCHOR_YEAR).ok_or_else(|| {
        Error::Config(format!("no land-cover asset for anchor year {ANCHOR_YEAR}"))
    })?;
    let labels = Image::source(label_asset)
        .select_index(0)
        .to_int()
        .rename([BAND_LABEL])
        .clip(aoi);

    let p = &cfg.parameters;
    let spec = StratifiedSampleSpec {
        class_band: BAND_LABEL.to_string(),
        class_values: (1..=p.n_classes).collect(),
        class_points: vec![p.samples_per_class; p.n_classes as usize],
        scale: SAMPLE_SCALE,
        seed: p.seed,
        tile_scale: SAMPLE_TILE_SCALE,
        geometries: false,
    };
    let samples = svc.stratified_sample(&labels.add_bands(&stack), aoi, &spec)?;

    svc.train_forest(&ForestSpec { trees: p.rf_trees, seed: p.seed }, &samples, &FEATURE_BANDS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierParams, ExportScales};
    use crate::engine::grid::Grid;
    use crate::engine::{GridGeometry, LocalEngine};
    use crate::predictors::DEM_ASSET;
    use std::collections::BTreeMap;

    /// 8x8 world: western half low-index class 1, eastern half high-index
    /// class 2.
    fn demo_world() -> (LocalEngine, ClassifyConfig) {
        let geometry = GridGeometry::new(8, 8, Aoi::new(20.0, 21.0, 38.0, 39.0));
        let mut engine = LocalEngine::new(geometry);

        let mut ndvi = Vec::new();
        let mut lc = Vec::new();
        for _row in 0..8 {
            for col in 0..8 {
                let west = col < 4;
                ndvi.push(if west { 0.1 } else { 0.7 });
                lc.push(if west { 1.0 } else { 2.0 });
            }
        }
        engine.insert_band("demo/ndvi_1990", "b1", Grid::from_values(8, 8, ndvi));
        engine.insert_band(DEM_ASSET, "elevation", Grid::filled(8, 8, 300.0));
        for year in crate::prior::EPOCH_YEARS {
            engine.insert_band(
                format!("demo/clc_{year}"),
                "landcover",
                Grid::from_values(8, 8, lc.clone()),
            );
        }

        let mut ndvi_assets = BTreeMap::new();
        ndvi_assets.insert(1990, "demo/ndvi_1990".to_string());
        let mut corine_assets = BTreeMap::new();
        for year in crate::prior::EPOCH_YEARS {
            corine_assets.insert(year, format!("demo/clc_{year}"));
        }
        let cfg = ClassifyConfig {
            project_id: "demo".into(),
            aoi_asset: "demo/aoi".into(),
            export_folder: "exports".into(),
            ndvi_assets,
            corine_assets,
            parameters: ClassifierParams {
                n_classes: 3,
                samples_per_class: 20,
                rf_trees: 15,
                seed: 42,
                prior_alpha: 0.6,
                min_patch_size: 4,
            },
            export_scales: ExportScales { tm: 30.0, mss: 60.0 },
        };
        (engine, cfg)
    }

    #[test]
    fn trains_on_present_classes_only() {
        let (engine, cfg) = demo_world();
        let aoi = engine.full_region();
        let model = train_classifier(
            &engine,
            &cfg,
            &aoi,
            AnchorStats { mean: 0.4, std: 0.3 },
        )
        .unwrap();
        // Class 3 never occurs in the labels, so the model cannot learn it.
        assert_eq!(model.classes(), &[1, 2]);
        assert_eq!(
            model.feature_names(),
            FEATURE_BANDS.iter().map(|s| s.to_string()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn training_is_deterministic_for_a_fixed_seed() {
        let (engine, cfg) = demo_world();
        let aoi = engine.full_region();
        let stats = AnchorStats { mean: 0.4, std: 0.3 };
        let a = train_classifier(&engine, &cfg, &aoi, stats).unwrap();
        let b = train_classifier(&engine, &cfg, &aoi, stats).unwrap();
        assert_eq!(a.classes(), b.classes());

        // The payload type is backend-private; determinism is observable
        // through classification.
        let stack = predictor_stack(&cfg, 1990, &aoi, stats).unwrap();
        let ca = engine.evaluate(&stack.classify(&a)).unwrap();
        let cb = engine.evaluate(&stack.classify(&b)).unwrap();
        assert_eq!(ca, cb);
    }
}
