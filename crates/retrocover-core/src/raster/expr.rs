//! Lazy raster expression-graph nodes.
//!
//! Every operation on an [`crate::raster::Image`] appends a node here and
//! returns immediately. Nothing is materialized until a backend walks the
//! graph: reductions, sampling, training, and exports are the only
//! evaluation boundaries, and they live behind the service traits.

use std::sync::Arc;

use crate::raster::Aoi;
use crate::service::TrainedModel;

/// Per-pixel unary casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Identity on values; marks the band as floating point.
    ToFloat,
    /// Truncate toward zero.
    ToInt,
    /// Truncate toward zero and clamp to 0..=255.
    ToByte,
}

/// Per-pixel binary operations. Comparisons and logic yield 0/1 bands;
/// logic ops treat any non-zero value as true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    /// Division by zero masks the output pixel.
    Divide,
    Eq,
    Gte,
    Lte,
    And,
    Or,
}

/// Band selection by position or name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandSelector {
    Index(usize),
    Name(String),
    Names(Vec<String>),
}

/// A node in the deferred computation graph.
///
/// Band names are a property of evaluation, not of graph building: selectors
/// and renames carry the requested names, and any mismatch surfaces as a
/// compute error when a backend walks the graph.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A raster asset resolved by the compute backend.
    Source { asset: String },
    /// A single constant band, valid everywhere.
    Constant { value: f64 },
    /// Two bands, `longitude` and `latitude`, holding pixel-center coordinates.
    PixelLonLat,
    /// Slope in degrees derived from the first band of `input` (elevation).
    Slope { input: Arc<Expr> },
    Unary {
        input: Arc<Expr>,
        op: UnaryOp,
    },
    /// Bandwise binary op. A single-band operand broadcasts against a
    /// multi-band one; the output keeps the multi-band operand's names.
    Binary {
        lhs: Arc<Expr>,
        rhs: Arc<Expr>,
        op: BinaryOp,
    },
    Clamp {
        input: Arc<Expr>,
        lo: f64,
        hi: f64,
    },
    Select {
        input: Arc<Expr>,
        selector: BandSelector,
    },
    Rename {
        input: Arc<Expr>,
        names: Vec<String>,
    },
    /// Band concatenation, in order.
    Cat { parts: Vec<Arc<Expr>> },
    /// Masks pixels where the first band of `mask` is zero or itself masked.
    UpdateMask {
        input: Arc<Expr>,
        mask: Arc<Expr>,
    },
    /// Backfills masked pixels of `input` with `fallback` where the latter
    /// is valid.
    Unmask {
        input: Arc<Expr>,
        fallback: Arc<Expr>,
    },
    /// Masks pixels whose centers fall outside the region.
    Clip {
        input: Arc<Expr>,
        region: Aoi,
    },
    /// Majority vote over the square (2·radius+1)² window, valid neighbors
    /// only. Value ties resolve to the smallest value; masked centers stay
    /// masked.
    FocalMode {
        input: Arc<Expr>,
        radius: u32,
    },
    /// Size of the same-value connected component each pixel belongs to,
    /// counted up to `max_size`.
    ConnectedPixelCount {
        input: Arc<Expr>,
        max_size: u32,
        eight_connected: bool,
    },
    /// 0-based index of the maximum band at each pixel; exact ties resolve
    /// to the lowest band index. Masked wherever any input band is masked.
    BandArgmax { input: Arc<Expr> },
    /// Per-class probability bands (`k<c>` for each learned class) from a
    /// trained model applied to the named feature bands of `input`.
    Classify {
        input: Arc<Expr>,
        model: TrainedModel,
    },
}
