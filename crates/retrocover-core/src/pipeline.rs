//! Stage orchestrators.
//!
//! Each stage validates its configuration, resolves the region of interest,
//! performs the run-wide blocking reductions once, then walks its targets
//! sequentially. Per-target work is individually fenced: one failed year or
//! pair loses only its own export, is logged, and is reported in the run
//! summary alongside the successes.

use tracing::{info, warn};

use crate::config::{AssetRef, ClassifyConfig, HarmonizeConfig, TransitionConfig, YearPair};
use crate::error::{Error, Result};
use crate::fusion::classify_year;
use crate::harmonize::{harmonize, percentile_range, PercentileRange};
use crate::postprocess::post_process;
use crate::predictors::{anchor_statistics, load_single_band, predictor_stack, AnchorStats, BAND_NDVI};
use crate::prior::{temporal_prior, PriorEpochs, ANCHOR_YEAR};
use crate::raster::{Aoi, Image};
use crate::service::{
    ExportSink, ImageExportSpec, JobHandle, RasterComputeService, TableExportSpec, TableFormat,
    TrainedModel,
};
use crate::trainer::train_classifier;
use crate::transitions::{
    check_implausible, load_landcover, transition_histogram, transition_image, QcOutcome,
};

/// First year of the higher-resolution sensor era; earlier years export at
/// the coarser scale.
pub const TM_ERA_START: u16 = 1984;

/// Per-year outcome of a harmonization or classification run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<u16>,
    pub failures: Vec<(u16, Error)>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-pair outcome of a transition run, with the QC verdicts of the pairs
/// that completed.
#[derive(Debug, Default)]
pub struct TransitionSummary {
    pub completed: Vec<(YearPair, QcOutcome)>,
    pub failures: Vec<(YearPair, Error)>,
}

impl TransitionSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Harmonize every target year onto the reference year's percentile span
/// and submit one image export per target.
pub fn run_harmonization(
    svc: &dyn RasterComputeService,
    sink: &dyn ExportSink,
    cfg: &HarmonizeConfig,
) -> Result<RunSummary> {
    cfg.validate()?;
    let region = svc.resolve_region(&cfg.aoi_asset)?;

    let reference = load_single_band(&cfg.assets.reference.path, BAND_NDVI, &region);
    let ref_range = percentile_range(
        svc,
        &reference,
        BAND_NDVI,
        &region,
        cfg.assets.reference.scale,
    )?;
    info!(
        reference_year = cfg.assets.reference.year,
        p2 = ref_range.p2,
        p98 = ref_range.p98,
        "reference percentile range resolved"
    );

    let mut summary = RunSummary::default();
    for target in &cfg.assets.targets {
        match harmonize_one(svc, sink, cfg, &region, ref_range, target) {
            Ok(handle) => {
                info!(year = target.year, job = handle.id, "harmonized export submitted");
                summary.completed.push(target.year);
            }
            Err(err) => {
                warn!(year = target.year, %err, "harmonization failed for year");
                summary.failures.push((target.year, err));
            }
        }
    }
    Ok(summary)
}

fn harmonize_one(
    svc: &dyn RasterComputeService,
    sink: &dyn ExportSink,
    cfg: &HarmonizeConfig,
    region: &Aoi,
    ref_range: PercentileRange,
    target: &AssetRef,
) -> Result<JobHandle> {
    let image = load_single_band(&target.path, BAND_NDVI, region);
    let range = percentile_range(svc, &image, BAND_NDVI, region, target.scale)?;
    let mapped = harmonize(&image, range, ref_range);

    let description =
        format!("NDVI_{}_Harmonized_to_{}", target.year, cfg.assets.reference.year);
    sink.submit_image(
        &mapped,
        &ImageExportSpec {
            description: description.clone(),
            folder: cfg.export_folder.clone(),
            filename: description,
            region: region.clone(),
            scale: target.scale,
        },
    )
}

/// Train the anchor-year classifier once, then classify, clean and export
/// every target year.
pub fn run_classification(
    svc: &dyn RasterComputeService,
    sink: &dyn ExportSink,
    cfg: &ClassifyConfig,
) -> Result<RunSummary> {
    cfg.validate()?;
    let region = svc.resolve_region(&cfg.aoi_asset)?;

    let anchor_asset = cfg.ndvi_assets.get(&ANCHOR_YEAR).ok_or_else(|| {
        Error::Config(format!("ndvi_assets must include the anchor year {ANCHOR_YEAR}"))
    })?;
    let anchor = load_single_band(anchor_asset, BAND_NDVI, &region);
    let stats = anchor_statistics(svc, &anchor, &region)?;
    info!(mean = stats.mean, std = stats.std, "anchor index statistics resolved");

    let model = train_classifier(svc, cfg, &region, stats)?;
    info!(classes = ?model.classes(), "anchor classifier trained");
    let prior = temporal_prior(
        &PriorEpochs::from_config(cfg, &region)?,
        cfg.parameters.n_classes,
    );

    let mut summary = RunSummary::default();
    for year in cfg.target_years() {
        match classify_one(sink, cfg, &region, stats, &model, &prior, year) {
            Ok(handle) => {
                info!(year, job = handle.id, "classified export submitted");
                summary.completed.push(year);
            }
            Err(err) => {
                warn!(year, %err, "classification failed for year");
                summary.failures.push((year, err));
            }
        }
    }
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
fn classify_one(
    sink: &dyn ExportSink,
    cfg: &ClassifyConfig,
    region: &Aoi,
    stats: AnchorStats,
    model: &TrainedModel,
    prior: &Image,
    year: u16,
) -> Result<JobHandle> {
    let stack = predictor_stack(cfg, year, region, stats)?;
    let label = classify_year(
        &stack,
        model,
        prior,
        cfg.parameters.prior_alpha,
        cfg.parameters.n_classes,
        region,
    );
    let cleaned = post_process(&label, cfg.parameters.min_patch_size);

    let scale = if year >= TM_ERA_START {
        cfg.export_scales.tm
    } else {
        cfg.export_scales.mss
    };
    let description = format!("Pseudo_CORINE_{year}_V3");
    sink.submit_image(
        &cleaned,
        &ImageExportSpec {
            description: description.clone(),
            folder: cfg.export_folder.clone(),
            filename: description,
            region: region.clone(),
            scale,
        },
    )
}

/// Export transition statistics and run the plausibility check for every
/// configured year pair.
pub fn run_transitions(
    svc: &dyn RasterComputeService,
    sink: &dyn ExportSink,
    cfg: &TransitionConfig,
) -> Result<TransitionSummary> {
    cfg.validate()?;
    let region = svc.resolve_region(&cfg.aoi_asset)?;

    let mut summary = TransitionSummary::default();
    for &pair in &cfg.pairs {
        match transition_one(svc, sink, cfg, &region, pair) {
            Ok(qc) => {
                info!(from = pair.0, to = pair.1, verdict = %qc, "transition pair exported");
                summary.completed.push((pair, qc));
            }
            Err(err) => {
                warn!(from = pair.0, to = pair.1, %err, "transition pair failed");
                summary.failures.push((pair, err));
            }
        }
    }
    Ok(summary)
}

fn transition_one(
    svc: &dyn RasterComputeService,
    sink: &dyn ExportSink,
    cfg: &TransitionConfig,
    region: &Aoi,
    pair: YearPair,
) -> Result<QcOutcome> {
    let YearPair(from_year, to_year) = pair;
    let asset = |year: u16| -> Result<&String> {
        cfg.assets
            .get(&year)
            .ok_or_else(|| Error::Config(format!("no land-cover asset for year {year}")))
    };
    let from = load_landcover(asset(from_year)?, cfg.n_classes, region);
    let to = load_landcover(asset(to_year)?, cfg.n_classes, region);

    let transition = transition_image(&from, &to);
    let records =
        transition_histogram(svc, &transition, region, cfg.scale, from_year, to_year)?;

    let description = format!("Transition_Stats_{from_year}_{to_year}");
    sink.submit_table(
        &records,
        &TableExportSpec {
            description: description.clone(),
            folder: cfg.export_folder.clone(),
            filename: description,
            format: TableFormat::Csv,
        },
    )?;

    check_implausible(svc, &from, &to, region, cfg.scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierParams, ExportScales, HarmonizeAssets};
    use crate::engine::grid::Grid;
    use crate::engine::{CollectingSink, GridGeometry, LocalEngine, SubmittedJob};
    use crate::predictors::DEM_ASSET;
    use std::collections::BTreeMap;

    const AOI: &str = "demo/aoi";

    fn base_engine(w: usize, h: usize) -> LocalEngine {
        let bounds = Aoi::new(20.0, 21.0, 38.0, 39.0);
        let mut engine = LocalEngine::new(GridGeometry::new(w, h, bounds.clone()));
        engine.insert_region(AOI, bounds);
        engine
    }

    #[test]
    fn harmonization_isolates_per_year_failures() {
        let mut engine = base_engine(4, 4);
        let spread: Vec<f64> = (0..16).map(|i| i as f64 / 20.0).collect();
        engine.insert_band("demo/ndvi_1990", "b1", Grid::from_values(4, 4, spread.clone()));
        engine.insert_band("demo/ndvi_1980", "b1", Grid::from_values(4, 4, spread));
        // 1975 is configured but never registered, so its range reduction fails.

        let cfg = HarmonizeConfig {
            project_id: "demo".into(),
            aoi_asset: AOI.into(),
            export_folder: "exports".into(),
            assets: HarmonizeAssets {
                reference: AssetRef { year: 1990, path: "demo/ndvi_1990".into(), scale: 30.0 },
                targets: vec![
                    AssetRef { year: 1975, path: "demo/ndvi_1975".into(), scale: 60.0 },
                    AssetRef { year: 1980, path: "demo/ndvi_1980".into(), scale: 60.0 },
                ],
            },
        };

        let sink = CollectingSink::new();
        let summary = run_harmonization(&engine, &sink, &cfg).unwrap();
        assert_eq!(summary.completed, vec![1980]);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, 1975);
        assert!(!summary.all_succeeded());

        let jobs = sink.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].description(), "NDVI_1980_Harmonized_to_1990");
    }

    fn classify_world() -> (LocalEngine, ClassifyConfig) {
        let mut engine = base_engine(8, 8);
        let mut ndvi = Vec::new();
        let mut lc = Vec::new();
        for _row in 0..8 {
            for col in 0..8 {
                let west = col < 4;
                ndvi.push(if west { 0.1 } else { 0.7 });
                lc.push(if west { 1.0 } else { 2.0 });
            }
        }
        for asset in ["demo/ndvi_1990", "demo/ndvi_1975", "demo/ndvi_1986"] {
            engine.insert_band(asset, "b1", Grid::from_values(8, 8, ndvi.clone()));
        }
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
        ndvi_assets.insert(1975, "demo/ndvi_1975".to_string());
        ndvi_assets.insert(1986, "demo/ndvi_1986".to_string());
        let mut corine_assets = BTreeMap::new();
        for year in crate::prior::EPOCH_YEARS {
            corine_assets.insert(year, format!("demo/clc_{year}"));
        }
        let cfg = ClassifyConfig {
            project_id: "demo".into(),
            aoi_asset: AOI.into(),
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
    fn classification_exports_every_target_year_at_its_era_scale() {
        let (engine, cfg) = classify_world();
        let sink = CollectingSink::new();
        let summary = run_classification(&engine, &sink, &cfg).unwrap();
        assert_eq!(summary.completed, vec![1975, 1986]);
        assert!(summary.all_succeeded());

        let jobs = sink.jobs();
        assert_eq!(jobs.len(), 2);
        let scale_of = |description: &str| -> f64 {
            jobs.iter()
                .find_map(|j| match j {
                    SubmittedJob::Image { spec, .. } if spec.description == description => {
                        Some(spec.scale)
                    }
                    _ => None,
                })
                .unwrap_or_else(|| panic!("missing job {description}"))
        };
        // 1975 predates the TM era, 1986 does not.
        assert_eq!(scale_of("Pseudo_CORINE_1975_V3"), 60.0);
        assert_eq!(scale_of("Pseudo_CORINE_1986_V3"), 30.0);
    }

    #[test]
    fn classified_exports_evaluate_to_valid_labels() {
        let (engine, cfg) = classify_world();
        let sink = CollectingSink::new();
        run_classification(&engine, &sink, &cfg).unwrap();
        for job in sink.jobs() {
            let SubmittedJob::Image { image, spec } = job else {
                panic!("expected image jobs only");
            };
            let out = engine.evaluate(&image).unwrap();
            let grid = out.band("lc").unwrap_or_else(|| {
                panic!("{}: missing lc band", spec.description)
            });
            for v in grid.valid_values() {
                assert!(
                    (1..=3).contains(&(v as u8)),
                    "{}: label {v} out of range",
                    spec.description
                );
            }
        }
    }

    #[test]
    fn transitions_export_tables_and_report_qc() {
        let mut engine = base_engine(4, 4);
        engine.insert_band("demo/lc_1990", "landcover", Grid::filled(4, 4, 3.0));
        engine.insert_band("demo/lc_2000", "landcover", Grid::filled(4, 4, 1.0));
        engine.insert_band("demo/lc_2018", "landcover", Grid::filled(4, 4, 2.0));

        let mut assets = BTreeMap::new();
        assets.insert(1990, "demo/lc_1990".to_string());
        assets.insert(2000, "demo/lc_2000".to_string());
        assets.insert(2006, "demo/lc_2006".to_string()); // never registered
        assets.insert(2018, "demo/lc_2018".to_string());
        let cfg = TransitionConfig {
            project_id: "demo".into(),
            aoi_asset: AOI.into(),
            export_folder: "exports".into(),
            assets,
            pairs: vec![YearPair(1990, 2000), YearPair(2000, 2006), YearPair(2000, 2018)],
            n_classes: 7,
            scale: 100.0,
        };

        let sink = CollectingSink::new();
        let summary = run_transitions(&engine, &sink, &cfg).unwrap();

        // The 2006 asset is missing from the engine: only that pair fails.
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, YearPair(2000, 2006));
        assert_eq!(summary.completed.len(), 2);

        let (_, qc_deforestation) = summary.completed[0];
        match qc_deforestation {
            QcOutcome::Ratio { percent, .. } => assert!((percent - 100.0).abs() < 1e-9),
            QcOutcome::NoData => panic!("expected a ratio"),
        }

        let jobs = sink.jobs();
        assert_eq!(jobs.len(), 2);
        let SubmittedJob::Table { records, spec } = &jobs[0] else {
            panic!("expected a table job");
        };
        assert_eq!(spec.description, "Transition_Stats_1990_2000");
        assert_eq!(spec.format, TableFormat::Csv);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].transition_code, 301);
        assert_eq!(records[0].pixel_count, 16);
    }
}
