//! Deferred raster images and regions of interest.
//!
//! [`Image`] is a cheap handle over a shared expression graph. Builder
//! methods append nodes and never block; the invariant of the whole module
//! is that graph construction performs no computation and no I/O.

pub mod expr;

use std::sync::Arc;

use crate::service::TrainedModel;
use expr::{BandSelector, BinaryOp, Expr, UnaryOp};

/// Region of interest: an immutable geographic bounding rectangle limiting
/// all reductions and exports in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Aoi {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl Aoi {
    pub fn new(min_lon: f64, max_lon: f64, min_lat: f64, max_lat: f64) -> Self {
        Self { min_lon, max_lon, min_lat, max_lat }
    }

    #[inline]
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }
}

/// A deferred, distributed raster: a handle over a computation graph.
#[derive(Debug, Clone)]
pub struct Image {
    expr: Arc<Expr>,
}

impl Image {
    fn wrap(expr: Expr) -> Self {
        Self { expr: Arc::new(expr) }
    }

    /// A raster asset, resolved by the compute backend at evaluation time.
    pub fn source(asset: impl Into<String>) -> Self {
        Self::wrap(Expr::Source { asset: asset.into() })
    }

    /// A single constant band, valid everywhere.
    pub fn constant(value: f64) -> Self {
        Self::wrap(Expr::Constant { value })
    }

    /// Pixel-center coordinates as two bands, `longitude` and `latitude`.
    pub fn pixel_lon_lat() -> Self {
        Self::wrap(Expr::PixelLonLat)
    }

    /// Concatenate the bands of all parts, in order.
    pub fn cat(parts: &[Image]) -> Self {
        Self::wrap(Expr::Cat {
            parts: parts.iter().map(|p| p.expr.clone()).collect(),
        })
    }

    /// The underlying graph node, for backends.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    fn unary(&self, op: UnaryOp) -> Self {
        Self::wrap(Expr::Unary { input: self.expr.clone(), op })
    }

    fn binary(&self, rhs: impl Into<Image>, op: BinaryOp) -> Self {
        Self::wrap(Expr::Binary {
            lhs: self.expr.clone(),
            rhs: rhs.into().expr,
            op,
        })
    }

    pub fn add(&self, rhs: impl Into<Image>) -> Self {
        self.binary(rhs, BinaryOp::Add)
    }

    pub fn subtract(&self, rhs: impl Into<Image>) -> Self {
        self.binary(rhs, BinaryOp::Subtract)
    }

    pub fn multiply(&self, rhs: impl Into<Image>) -> Self {
        self.binary(rhs, BinaryOp::Multiply)
    }

    pub fn divide(&self, rhs: impl Into<Image>) -> Self {
        self.binary(rhs, BinaryOp::Divide)
    }

    /// Equality test; yields a 0/1 band.
    pub fn eq(&self, rhs: impl Into<Image>) -> Self {
        self.binary(rhs, BinaryOp::Eq)
    }

    pub fn gte(&self, rhs: impl Into<Image>) -> Self {
        self.binary(rhs, BinaryOp::Gte)
    }

    pub fn lte(&self, rhs: impl Into<Image>) -> Self {
        self.binary(rhs, BinaryOp::Lte)
    }

    /// Logical and; non-zero is true.
    pub fn and(&self, rhs: impl Into<Image>) -> Self {
        self.binary(rhs, BinaryOp::And)
    }

    /// Logical or; non-zero is true.
    pub fn or(&self, rhs: impl Into<Image>) -> Self {
        self.binary(rhs, BinaryOp::Or)
    }

    pub fn clamp(&self, lo: f64, hi: f64) -> Self {
        Self::wrap(Expr::Clamp { input: self.expr.clone(), lo, hi })
    }

    pub fn to_float(&self) -> Self {
        self.unary(UnaryOp::ToFloat)
    }

    pub fn to_int(&self) -> Self {
        self.unary(UnaryOp::ToInt)
    }

    pub fn to_byte(&self) -> Self {
        self.unary(UnaryOp::ToByte)
    }

    /// Select a single band by position. Total on any non-empty image:
    /// index 0 of a single-band image is the image itself.
    pub fn select_index(&self, index: usize) -> Self {
        Self::wrap(Expr::Select {
            input: self.expr.clone(),
            selector: BandSelector::Index(index),
        })
    }

    /// Select a single band by name.
    pub fn select(&self, name: impl Into<String>) -> Self {
        Self::wrap(Expr::Select {
            input: self.expr.clone(),
            selector: BandSelector::Name(name.into()),
        })
    }

    /// Select several bands by name, in the given order.
    pub fn select_names<I, S>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::wrap(Expr::Select {
            input: self.expr.clone(),
            selector: BandSelector::Names(names.into_iter().map(Into::into).collect()),
        })
    }

    /// Rename all bands; the name count must match the band count at
    /// evaluation time.
    pub fn rename<I, S>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::wrap(Expr::Rename {
            input: self.expr.clone(),
            names: names.into_iter().map(Into::into).collect(),
        })
    }

    /// Append the bands of `other` after this image's bands.
    pub fn add_bands(&self, other: &Image) -> Self {
        Image::cat(&[self.clone(), other.clone()])
    }

    pub fn update_mask(&self, mask: &Image) -> Self {
        Self::wrap(Expr::UpdateMask {
            input: self.expr.clone(),
            mask: mask.expr.clone(),
        })
    }

    pub fn unmask(&self, fallback: &Image) -> Self {
        Self::wrap(Expr::Unmask {
            input: self.expr.clone(),
            fallback: fallback.expr.clone(),
        })
    }

    pub fn clip(&self, region: &Aoi) -> Self {
        Self::wrap(Expr::Clip {
            input: self.expr.clone(),
            region: region.clone(),
        })
    }

    pub fn focal_mode(&self, radius: u32) -> Self {
        Self::wrap(Expr::FocalMode { input: self.expr.clone(), radius })
    }

    pub fn connected_pixel_count(&self, max_size: u32, eight_connected: bool) -> Self {
        Self::wrap(Expr::ConnectedPixelCount {
            input: self.expr.clone(),
            max_size,
            eight_connected,
        })
    }

    /// 0-based index of the maximum band; ties resolve to the lowest index.
    pub fn band_argmax(&self) -> Self {
        Self::wrap(Expr::BandArgmax { input: self.expr.clone() })
    }

    /// Slope in degrees derived from the first band (elevation in metres).
    pub fn slope(&self) -> Self {
        Self::wrap(Expr::Slope { input: self.expr.clone() })
    }

    /// Per-class probability bands (`k<c>`) from a trained model.
    pub fn classify(&self, model: &TrainedModel) -> Self {
        Self::wrap(Expr::Classify {
            input: self.expr.clone(),
            model: model.clone(),
        })
    }
}

impl From<f64> for Image {
    fn from(value: f64) -> Self {
        Image::constant(value)
    }
}

impl From<&Image> for Image {
    fn from(image: &Image) -> Self {
        image.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_building_is_pure_and_shared() {
        let base = Image::source("projects/demo/ndvi_1990");
        let derived = base.subtract(0.2).divide(0.5).clamp(-1.0, 1.0);
        // The source node is shared, not copied.
        let reused = base.add(&derived);
        match reused.expr() {
            Expr::Binary { .. } => {}
            other => panic!("expected a binary node, got {other:?}"),
        }
    }

    #[test]
    fn aoi_contains_is_inclusive_on_edges() {
        let aoi = Aoi::new(10.0, 20.0, 40.0, 50.0);
        assert!(aoi.contains(10.0, 40.0));
        assert!(aoi.contains(20.0, 50.0));
        assert!(!aoi.contains(9.999, 45.0));
        assert!(!aoi.contains(15.0, 50.001));
    }
}
