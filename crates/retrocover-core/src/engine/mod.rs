//! In-memory reference backend.
//!
//! Implements [`RasterComputeService`] and [`ExportSink`] over small dense
//! grids so the graph semantics are executable in tests and offline studies.
//! Assumptions, documented rather than configurable: every asset is
//! co-registered on one shared grid geometry, and the `scale`, `best_effort`
//! and `max_pixels` options of reduction requests are accepted and ignored.

pub mod grid;

mod eval;
mod forest;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::raster::{Aoi, Image};
use crate::service::{
    ExportSink, ForestSpec, ImageExportSpec, JobHandle, RasterComputeService, ReduceOpts,
    Reducer, SampleRecord, SampleSet, StatMap, StratifiedSampleSpec, TableExportSpec,
    TrainedModel,
};
use crate::transitions::TransitionRecord;
use eval::EvalContext;
use grid::{Grid, GridStack};

/// The shared georeference of every grid in a [`LocalEngine`].
#[derive(Debug, Clone)]
pub struct GridGeometry {
    pub width: usize,
    pub height: usize,
    pub bounds: Aoi,
}

impl GridGeometry {
    pub fn new(width: usize, height: usize, bounds: Aoi) -> Self {
        Self { width, height, bounds }
    }

    /// Pixel-center longitude of a column (north-up, west-to-east).
    #[inline]
    pub fn lon_at(&self, col: usize) -> f64 {
        self.bounds.min_lon
            + (col as f64 + 0.5) / self.width as f64 * (self.bounds.max_lon - self.bounds.min_lon)
    }

    /// Pixel-center latitude of a row (row 0 is the northern edge).
    #[inline]
    pub fn lat_at(&self, row: usize) -> f64 {
        self.bounds.max_lat
            - (row as f64 + 0.5) / self.height as f64
                * (self.bounds.max_lat - self.bounds.min_lat)
    }

    /// Isotropic cellsize in metres from the geographic extent; falls back
    /// to 90 m when the extent is degenerate.
    pub(crate) fn cellsize_m(&self) -> f64 {
        let lat_extent = (self.bounds.max_lat - self.bounds.min_lat).abs();
        let lon_extent = (self.bounds.max_lon - self.bounds.min_lon).abs();
        let cy = lat_extent / self.height.max(1) as f64 * 111_320.0;
        let mid_lat = (self.bounds.min_lat + self.bounds.max_lat) / 2.0;
        let cx =
            lon_extent / self.width.max(1) as f64 * 111_320.0 * mid_lat.to_radians().cos();
        let avg = (cy + cx) / 2.0;
        if avg < 1e-3 {
            90.0
        } else {
            avg
        }
    }
}

/// Single-process compute backend over registered grid assets.
pub struct LocalEngine {
    geometry: GridGeometry,
    assets: BTreeMap<String, GridStack>,
    regions: BTreeMap<String, Aoi>,
}

impl LocalEngine {
    pub fn new(geometry: GridGeometry) -> Self {
        Self { geometry, assets: BTreeMap::new(), regions: BTreeMap::new() }
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    /// The engine's full extent as a region of interest.
    pub fn full_region(&self) -> Aoi {
        self.geometry.bounds.clone()
    }

    pub fn insert_asset(&mut self, id: impl Into<String>, stack: GridStack) {
        self.assets.insert(id.into(), stack);
    }

    /// Register a single-band asset.
    pub fn insert_band(&mut self, id: impl Into<String>, band: impl Into<String>, grid: Grid) {
        self.assets.insert(id.into(), GridStack::single(band, grid));
    }

    pub fn insert_region(&mut self, id: impl Into<String>, region: Aoi) {
        self.regions.insert(id.into(), region);
    }

    /// Materialize an image. This is the explicit evaluation boundary: the
    /// only place graph nodes are executed, and it blocks until done.
    pub fn evaluate(&self, image: &Image) -> Result<GridStack> {
        let ctx = EvalContext { assets: &self.assets, geometry: &self.geometry };
        eval::eval(image.expr(), &ctx)
    }

    /// Valid in-region values of one band, row-major.
    fn region_values(&self, grid: &Grid, region: &Aoi) -> Vec<f64> {
        let mut values = Vec::new();
        for r in 0..grid.height {
            for c in 0..grid.width {
                if grid.is_valid(r, c)
                    && region.contains(self.geometry.lon_at(c), self.geometry.lat_at(r))
                {
                    values.push(grid.get(r, c));
                }
            }
        }
        values
    }
}

/// Percentile by linear interpolation on ascending values.
fn percentile(sorted: &[f64], q: u8) -> f64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = f64::from(q) / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let t = rank - lo as f64;
    sorted[lo] * (1.0 - t) + sorted[hi] * t
}

impl RasterComputeService for LocalEngine {
    fn resolve_region(&self, asset: &str) -> Result<Aoi> {
        self.regions
            .get(asset)
            .cloned()
            .ok_or_else(|| Error::UnknownAsset(asset.to_string()))
    }

    fn reduce_region(
        &self,
        image: &Image,
        reducer: &Reducer,
        region: &Aoi,
        _opts: &ReduceOpts,
    ) -> Result<StatMap> {
        let stack = self.evaluate(image)?;
        let mut out = StatMap::new();
        for (name, grid) in stack.iter() {
            let values = self.region_values(grid, region);
            match reducer {
                Reducer::Percentiles(qs) => {
                    if values.is_empty() {
                        return Err(Error::Compute(format!(
                            "percentile reducer over band {name:?} saw no valid pixels"
                        )));
                    }
                    let mut sorted = values;
                    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    for &q in qs {
                        out.insert(format!("{name}_p{q}"), percentile(&sorted, q));
                    }
                }
                Reducer::MeanStdDev => {
                    if values.is_empty() {
                        return Err(Error::Compute(format!(
                            "mean/stdDev reducer over band {name:?} saw no valid pixels"
                        )));
                    }
                    let n = values.len() as f64;
                    let mean = values.iter().sum::<f64>() / n;
                    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                    out.insert(format!("{name}_mean"), mean);
                    out.insert(format!("{name}_stdDev"), var.sqrt());
                }
                Reducer::Sum => {
                    out.insert(name.to_string(), values.iter().sum());
                }
                Reducer::Count => {
                    out.insert(name.to_string(), values.len() as f64);
                }
            }
        }
        Ok(out)
    }

    fn frequency_histogram(
        &self,
        image: &Image,
        band: &str,
        region: &Aoi,
        _opts: &ReduceOpts,
    ) -> Result<BTreeMap<i64, u64>> {
        let stack = self.evaluate(image)?;
        let grid = stack.band(band).ok_or_else(|| {
            Error::Compute(format!(
                "histogram band {band:?} not found; image has {:?}",
                stack.band_names()
            ))
        })?;
        let mut hist = BTreeMap::new();
        for v in self.region_values(grid, region) {
            *hist.entry(v.round() as i64).or_insert(0u64) += 1;
        }
        Ok(hist)
    }

    fn stratified_sample(
        &self,
        image: &Image,
        region: &Aoi,
        spec: &StratifiedSampleSpec,
    ) -> Result<SampleSet> {
        if spec.class_values.len() != spec.class_points.len() {
            return Err(Error::Compute(
                "class_values and class_points must have equal length".into(),
            ));
        }
        let stack = self.evaluate(image)?;
        let labels = stack.band(&spec.class_band).ok_or_else(|| {
            Error::Compute(format!(
                "class band {:?} not found; image has {:?}",
                spec.class_band,
                stack.band_names()
            ))
        })?;
        let features: Vec<(&str, &Grid)> =
            stack.iter().filter(|(name, _)| *name != spec.class_band).collect();

        let mut rng = StdRng::seed_from_u64(spec.seed);
        let mut records = Vec::new();
        for (&class, &budget) in spec.class_values.iter().zip(&spec.class_points) {
            // Candidates in row-major order so the draw is reproducible.
            let mut candidates = Vec::new();
            for r in 0..labels.height {
                for c in 0..labels.width {
                    let in_region =
                        region.contains(self.geometry.lon_at(c), self.geometry.lat_at(r));
                    if in_region
                        && labels.is_valid(r, c)
                        && labels.get(r, c).round() as i64 == i64::from(class)
                        && features.iter().all(|(_, g)| g.is_valid(r, c))
                    {
                        candidates.push((r, c));
                    }
                }
            }
            candidates.shuffle(&mut rng);
            candidates.truncate(budget as usize);
            for (r, c) in candidates {
                records.push(SampleRecord {
                    label: class,
                    features: features.iter().map(|(_, g)| g.get(r, c)).collect(),
                });
            }
        }

        Ok(SampleSet {
            feature_names: features.iter().map(|(n, _)| n.to_string()).collect(),
            records,
        })
    }

    fn train_forest(
        &self,
        spec: &ForestSpec,
        samples: &SampleSet,
        features: &[&str],
    ) -> Result<TrainedModel> {
        if samples.records.is_empty() {
            return Err(Error::Compute("cannot train on an empty sample set".into()));
        }
        let mut indices = Vec::with_capacity(features.len());
        for feature in features {
            let i = samples
                .feature_names
                .iter()
                .position(|n| n == feature)
                .ok_or_else(|| {
                    Error::Compute(format!(
                        "training feature {feature:?} missing from sample set {:?}",
                        samples.feature_names
                    ))
                })?;
            indices.push(i);
        }

        let labels: Vec<u8> = samples.records.iter().map(|r| r.label).collect();
        let rows: Vec<Vec<f64>> = samples
            .records
            .iter()
            .map(|r| indices.iter().map(|&i| r.features[i]).collect())
            .collect();

        let forest = forest::Forest::train(spec.trees, spec.seed, &labels, &rows);
        Ok(TrainedModel::new(
            forest.classes().to_vec(),
            features.iter().map(|f| f.to_string()).collect(),
            std::sync::Arc::new(forest),
        ))
    }
}

/// A submission captured by [`CollectingSink`].
#[derive(Debug, Clone)]
pub enum SubmittedJob {
    Image { spec: ImageExportSpec, image: Image },
    Table { spec: TableExportSpec, records: Vec<TransitionRecord> },
}

impl SubmittedJob {
    pub fn description(&self) -> &str {
        match self {
            SubmittedJob::Image { spec, .. } => &spec.description,
            SubmittedJob::Table { spec, .. } => &spec.description,
        }
    }
}

/// Export sink test double: records submissions, fire-and-forget.
#[derive(Default)]
pub struct CollectingSink {
    jobs: Mutex<Vec<SubmittedJob>>,
    next_id: AtomicU64,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<SubmittedJob> {
        self.jobs.lock().expect("sink lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, description: &str) -> JobHandle {
        JobHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            description: description.to_string(),
        }
    }
}

impl ExportSink for CollectingSink {
    fn submit_image(&self, image: &Image, spec: &ImageExportSpec) -> Result<JobHandle> {
        let handle = self.handle(&spec.description);
        self.jobs
            .lock()
            .expect("sink lock poisoned")
            .push(SubmittedJob::Image { spec: spec.clone(), image: image.clone() });
        Ok(handle)
    }

    fn submit_table(
        &self,
        records: &[TransitionRecord],
        spec: &TableExportSpec,
    ) -> Result<JobHandle> {
        let handle = self.handle(&spec.description);
        self.jobs
            .lock()
            .expect("sink lock poisoned")
            .push(SubmittedJob::Table { spec: spec.clone(), records: records.to_vec() });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_band(values: Vec<f64>, width: usize, height: usize) -> LocalEngine {
        let geometry =
            GridGeometry::new(width, height, Aoi::new(20.0, 21.0, 38.0, 39.0));
        let mut engine = LocalEngine::new(geometry);
        engine.insert_band("demo/ndvi", "NDVI", Grid::from_values(width, height, values));
        engine
    }

    #[test]
    fn percentile_reducer_keys_follow_band_naming() {
        let engine = engine_with_band((0..100).map(|i| i as f64 / 99.0).collect(), 10, 10);
        let image = Image::source("demo/ndvi");
        let stats = engine
            .reduce_region(
                &image,
                &Reducer::Percentiles(vec![2, 98]),
                &engine.full_region(),
                &ReduceOpts::at_scale(60.0),
            )
            .unwrap();
        let p2 = stats["NDVI_p2"];
        let p98 = stats["NDVI_p98"];
        assert!(p2 < p98, "p2={p2} should be below p98={p98}");
        assert!((p2 - 0.02).abs() < 0.01);
        assert!((p98 - 0.98).abs() < 0.01);
    }

    #[test]
    fn count_of_empty_region_is_zero_not_an_error() {
        let engine = engine_with_band(vec![1.0; 16], 4, 4);
        let nowhere = Aoi::new(150.0, 151.0, -10.0, -9.0);
        let stats = engine
            .reduce_region(
                &Image::source("demo/ndvi"),
                &Reducer::Count,
                &nowhere,
                &ReduceOpts::at_scale(60.0),
            )
            .unwrap();
        assert_eq!(stats["NDVI"], 0.0);
    }

    #[test]
    fn stratified_sample_is_deterministic_and_respects_budgets() {
        let mut values = vec![1.0; 64];
        for v in values.iter_mut().skip(32) {
            *v = 2.0;
        }
        let geometry = GridGeometry::new(8, 8, Aoi::new(20.0, 21.0, 38.0, 39.0));
        let mut engine = LocalEngine::new(geometry);
        let mut stack = GridStack::new();
        stack.push("lc", Grid::from_values(8, 8, values));
        stack.push("x", Grid::from_values(8, 8, (0..64).map(f64::from).collect()));
        engine.insert_asset("demo/labeled", stack);

        let spec = StratifiedSampleSpec {
            class_band: "lc".into(),
            class_values: vec![1, 2, 3],
            class_points: vec![10, 10, 10],
            scale: 60.0,
            seed: 42,
            tile_scale: 8,
            geometries: false,
        };
        let image = Image::source("demo/labeled");
        let a = engine.stratified_sample(&image, &engine.full_region(), &spec).unwrap();
        let b = engine.stratified_sample(&image, &engine.full_region(), &spec).unwrap();
        assert_eq!(a, b, "identical seed must reproduce the sample");

        assert_eq!(a.feature_names, vec!["x".to_string()]);
        assert_eq!(a.records.iter().filter(|r| r.label == 1).count(), 10);
        assert_eq!(a.records.iter().filter(|r| r.label == 2).count(), 10);
        // Class 3 never occurs: sampled zero times, silently.
        assert_eq!(a.records.iter().filter(|r| r.label == 3).count(), 0);
    }

    #[test]
    fn trained_model_reports_learned_class_subset() {
        let samples = SampleSet {
            feature_names: vec!["x".into(), "y".into()],
            records: (0..30)
                .map(|i| SampleRecord {
                    label: if i % 2 == 0 { 2 } else { 6 },
                    features: vec![f64::from(i % 2) * 10.0, f64::from(i)],
                })
                .collect(),
        };
        let engine = engine_with_band(vec![0.0; 16], 4, 4);
        let model = engine
            .train_forest(&ForestSpec { trees: 10, seed: 7 }, &samples, &["x", "y"])
            .unwrap();
        assert_eq!(model.classes(), &[2, 6]);
        assert!(model.contains_class(6));
        assert!(!model.contains_class(1));
    }

    #[test]
    fn collecting_sink_assigns_increasing_job_ids() {
        let sink = CollectingSink::new();
        let spec = ImageExportSpec {
            description: "job".into(),
            folder: "f".into(),
            filename: "job".into(),
            region: Aoi::new(0.0, 1.0, 0.0, 1.0),
            scale: 30.0,
        };
        let a = sink.submit_image(&Image::constant(1.0), &spec).unwrap();
        let b = sink.submit_image(&Image::constant(2.0), &spec).unwrap();
        assert!(b.id > a.id);
        assert_eq!(sink.len(), 2);
    }
}
