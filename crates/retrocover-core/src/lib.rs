//! Multi-decade land-cover reconstruction from harmonized vegetation-index
//! rasters.
//!
//! The crate builds lazy raster expression graphs ([`raster::Image`]) and
//! delegates all pixel work to a [`service::RasterComputeService`]; finished
//! products leave through a [`service::ExportSink`]. Three orchestrated
//! stages cover the workflow: percentile harmonization of a cross-sensor
//! index series onto a reference year, anchor-trained classification fused
//! with a temporal land-cover prior, and transition statistics with a
//! plausibility check. The [`engine`] module ships an in-memory reference
//! backend for both service traits.

pub mod config;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod harmonize;
pub mod pipeline;
pub mod postprocess;
pub mod predictors;
pub mod prior;
pub mod raster;
pub mod service;
pub mod trainer;
pub mod transitions;

pub use error::{Error, Result};
pub use raster::{Aoi, Image};
