//! External service seams: the distributed raster compute engine and the
//! export sink.
//!
//! Reductions, sampling, and training are synchronous and block the caller
//! until the distributed computation over the region completes; cost scales
//! with region size, resolution, and reducer complexity (a full frequency
//! histogram is markedly heavier than a scalar reducer). Export submissions
//! are asynchronous and fire-and-forget: a submission returns a job handle
//! with no local monitoring, completion callback, or cancellation.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::raster::{Aoi, Image};
use crate::transitions::TransitionRecord;

/// Ceiling passed with every reduction request.
pub const MAX_PIXELS: u64 = 10_000_000_000_000;

/// Region reducers. Output keys follow the remote engine's naming:
/// percentiles yield `<band>_p<q>`, mean/stdDev yield `<band>_mean` and
/// `<band>_stdDev`, and sum/count are keyed by the plain band name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reducer {
    Percentiles(Vec<u8>),
    MeanStdDev,
    Sum,
    /// Valid-pixel count per band.
    Count,
}

/// Options shared by all reduction-style calls.
#[derive(Debug, Clone)]
pub struct ReduceOpts {
    /// Nominal resolution in metres.
    pub scale: f64,
    /// Permit the engine to coarsen the computation for very large regions.
    pub best_effort: bool,
    pub max_pixels: u64,
}

impl ReduceOpts {
    pub fn at_scale(scale: f64) -> Self {
        Self { scale, best_effort: true, max_pixels: MAX_PIXELS }
    }
}

/// Scalar reduction output, keyed per the [`Reducer`] naming rules.
pub type StatMap = BTreeMap<String, f64>;

/// One stratified sample point: an integer label plus the feature vector,
/// ordered as [`SampleSet::feature_names`].
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub label: u8,
    pub features: Vec<f64>,
}

/// A finite stratified sample drawn from a labeled raster.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSet {
    pub feature_names: Vec<String>,
    pub records: Vec<SampleRecord>,
}

/// Stratified sampling request.
#[derive(Debug, Clone)]
pub struct StratifiedSampleSpec {
    /// Band holding the integer class labels.
    pub class_band: String,
    pub class_values: Vec<u8>,
    /// Points to draw per class, aligned with `class_values`.
    pub class_points: Vec<u32>,
    /// Sampling resolution in metres.
    pub scale: f64,
    pub seed: u64,
    /// Remote aggregation-tile multiplier; a throughput knob only.
    pub tile_scale: u32,
    /// Whether sampled points keep their geometries. The pipeline never
    /// needs them.
    pub geometries: bool,
}

/// Decision-forest training parameters.
#[derive(Debug, Clone, Copy)]
pub struct ForestSpec {
    pub trees: u32,
    pub seed: u64,
}

/// A trained classifier: an opaque backend payload plus the class list the
/// model actually learned, which may be a strict subset of the label space
/// when some classes were absent from the training sample.
#[derive(Clone)]
pub struct TrainedModel {
    classes: Vec<u8>,
    feature_names: Vec<String>,
    payload: Arc<dyn Any + Send + Sync>,
}

impl TrainedModel {
    pub fn new(
        classes: Vec<u8>,
        feature_names: Vec<String>,
        payload: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self { classes, feature_names, payload }
    }

    /// Classes present in the training sample, ascending.
    pub fn classes(&self) -> &[u8] {
        &self.classes
    }

    pub fn contains_class(&self, class: u8) -> bool {
        self.classes.contains(&class)
    }

    /// Feature bands the model expects, in training order.
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Backend-specific payload, if it is of type `T`.
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }
}

impl fmt::Debug for TrainedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainedModel")
            .field("classes", &self.classes)
            .field("feature_names", &self.feature_names)
            .finish_non_exhaustive()
    }
}

/// The distributed raster engine, as consumed by the pipeline. All methods
/// are synchronous; implementations must not be called from graph-building
/// code paths.
pub trait RasterComputeService {
    /// Resolve a geometry asset into a region of interest.
    fn resolve_region(&self, asset: &str) -> Result<Aoi>;

    /// Blocking scalar reduction over the region.
    fn reduce_region(
        &self,
        image: &Image,
        reducer: &Reducer,
        region: &Aoi,
        opts: &ReduceOpts,
    ) -> Result<StatMap>;

    /// Blocking full frequency histogram of one integer-valued band.
    fn frequency_histogram(
        &self,
        image: &Image,
        band: &str,
        region: &Aoi,
        opts: &ReduceOpts,
    ) -> Result<BTreeMap<i64, u64>>;

    /// Blocking class-stratified sample. Feature values come from every
    /// band except `spec.class_band`; pixels with any masked band are
    /// never sampled.
    fn stratified_sample(
        &self,
        image: &Image,
        region: &Aoi,
        spec: &StratifiedSampleSpec,
    ) -> Result<SampleSet>;

    /// Blocking decision-forest training over the given feature subset.
    fn train_forest(
        &self,
        spec: &ForestSpec,
        samples: &SampleSet,
        features: &[&str],
    ) -> Result<TrainedModel>;
}

/// Image export request.
#[derive(Debug, Clone)]
pub struct ImageExportSpec {
    pub description: String,
    pub folder: String,
    pub filename: String,
    pub region: Aoi,
    /// Export resolution in metres.
    pub scale: f64,
}

/// Table export request.
#[derive(Debug, Clone)]
pub struct TableExportSpec {
    pub description: String,
    pub folder: String,
    pub filename: String,
    pub format: TableFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
}

/// Handle for a submitted export job. Submission is fire-and-forget; the
/// handle exists for logging and bookkeeping only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: u64,
    pub description: String,
}

/// The delivery boundary the core submits finished products to.
pub trait ExportSink {
    fn submit_image(&self, image: &Image, spec: &ImageExportSpec) -> Result<JobHandle>;

    fn submit_table(
        &self,
        records: &[TransitionRecord],
        spec: &TableExportSpec,
    ) -> Result<JobHandle>;
}
