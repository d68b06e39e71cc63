//! Probability/prior fusion into a final label map.
//!
//! The classifier emits one probability band per learned class; the prior
//! emits one band per configured class. Fusion reindexes the probabilities
//! onto the full class range (a class the model never learned contributes a
//! zero band, so it can never win), applies the reinforcement weighting, and
//! takes a per-pixel argmax.

use crate::predictors::BAND_LABEL;
use crate::prior::class_band;
use crate::raster::{Aoi, Image};
use crate::service::TrainedModel;

/// Probability band name the classifier emits for a learned class.
pub fn learned_band(class: u8) -> String {
    format!("k{class}")
}

/// Reindex learned-class probability bands onto the full 1..=n_classes
/// range; unlearned classes get a constant-zero band. Band names follow
/// the prior's `p<c>` convention so the two stacks align.
fn reindex_probabilities(probs: &Image, model: &TrainedModel, n_classes: u8) -> Image {
    let bands: Vec<Image> = (1..=n_classes)
        .map(|c| {
            let band = if model.contains_class(c) {
                probs.select(learned_band(c))
            } else {
                Image::constant(0.0)
            };
            band.rename([class_band(c)])
        })
        .collect();
    Image::cat(&bands)
}

/// Classify one year's predictor stack and fuse with the temporal prior.
///
/// Fused score per class: `prob * (alpha + prior * (1 - alpha))`. With
/// `alpha = 1` the prior is ignored entirely; with `alpha = 0` it scales
/// probabilities directly. The winning class index (ties to the lowest
/// class id) plus one is the label, a byte in 1..=n_classes named `lc`.
/// Pure graph building.
pub fn classify_year(
    stack: &Image,
    model: &TrainedModel,
    prior: &Image,
    alpha: f64,
    n_classes: u8,
    aoi: &Aoi,
) -> Image {
    let probs = reindex_probabilities(&stack.classify(model), model, n_classes);
    let reinforcement = Image::constant(alpha).add(&prior.multiply(1.0 - alpha));
    probs
        .multiply(&reinforcement)
        .band_argmax()
        .add(1.0)
        .to_byte()
        .clip(aoi)
        .rename([BAND_LABEL])
}
