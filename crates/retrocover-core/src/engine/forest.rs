//! Seeded decision-forest classifier for the reference backend.
//!
//! A compact CART ensemble: per-tree bootstrap resampling, sqrt-of-features
//! bagging at every split, Gini impurity splits, and per-pixel probabilities
//! as the average of leaf class distributions. Deterministic for a fixed
//! seed and input order.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const MAX_DEPTH: usize = 12;
const MIN_SPLIT: usize = 4;

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        /// Class distribution aligned with `Forest::classes`.
        dist: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn leaf_dist<'a>(&'a self, features: &[f64]) -> &'a [f64] {
        let mut at = 0usize;
        loop {
            match &self.nodes[at] {
                Node::Leaf { dist } => return dist,
                Node::Split { feature, threshold, left, right } => {
                    at = if features[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// A trained forest over `classes`, in ascending class order.
#[derive(Debug, Clone)]
pub struct Forest {
    trees: Vec<Tree>,
    classes: Vec<u8>,
}

impl Forest {
    /// Train on parallel label/feature-row slices. Rows must be non-empty
    /// and rectangular.
    pub fn train(trees: u32, seed: u64, labels: &[u8], rows: &[Vec<f64>]) -> Self {
        assert_eq!(labels.len(), rows.len(), "label and row counts must match");
        assert!(!labels.is_empty(), "cannot train on an empty sample");
        let n_features = rows[0].len();

        let mut classes: Vec<u8> = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();

        let class_index = |label: u8| -> usize {
            classes.binary_search(&label).unwrap_or(0)
        };
        let targets: Vec<usize> = labels.iter().map(|&l| class_index(l)).collect();

        let mut rng = StdRng::seed_from_u64(seed);
        let built = (0..trees.max(1))
            .map(|_| {
                let sample: Vec<usize> =
                    (0..rows.len()).map(|_| rng.gen_range(0..rows.len())).collect();
                let mut nodes = Vec::new();
                grow(
                    &mut nodes,
                    &sample,
                    rows,
                    &targets,
                    classes.len(),
                    n_features,
                    0,
                    &mut rng,
                );
                Tree { nodes }
            })
            .collect();

        Self { trees: built, classes }
    }

    /// Classes present in the training sample, ascending.
    pub fn classes(&self) -> &[u8] {
        &self.classes
    }

    /// Per-class probabilities aligned with [`Forest::classes`]: the mean of
    /// leaf class distributions across all trees.
    pub fn predict_proba(&self, features: &[f64]) -> Vec<f64> {
        let mut acc = vec![0.0; self.classes.len()];
        for tree in &self.trees {
            for (a, p) in acc.iter_mut().zip(tree.leaf_dist(features)) {
                *a += p;
            }
        }
        let n = self.trees.len() as f64;
        for a in &mut acc {
            *a /= n;
        }
        acc
    }
}

/// Recursively grow a subtree over `sample`; returns the node index.
#[allow(clippy::too_many_arguments)]
fn grow(
    nodes: &mut Vec<Node>,
    sample: &[usize],
    rows: &[Vec<f64>],
    targets: &[usize],
    n_classes: usize,
    n_features: usize,
    depth: usize,
    rng: &mut StdRng,
) -> usize {
    let counts = class_counts(sample, targets, n_classes);
    let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;

    if pure || sample.len() < MIN_SPLIT || depth >= MAX_DEPTH {
        return push_leaf(nodes, &counts, sample.len());
    }

    // sqrt-of-features bagging: each split sees a fresh random subset.
    let mtry = (n_features as f64).sqrt().ceil() as usize;
    let mut candidates: Vec<usize> = (0..n_features).collect();
    candidates.shuffle(rng);
    candidates.truncate(mtry.max(1));

    let mut best: Option<(usize, f64, f64)> = None; // (feature, threshold, impurity)
    for &feature in &candidates {
        if let Some((threshold, impurity)) =
            best_split(sample, rows, targets, n_classes, feature)
        {
            if best.map_or(true, |(_, _, b)| impurity < b) {
                best = Some((feature, threshold, impurity));
            }
        }
    }

    let Some((feature, threshold, _)) = best else {
        // Every candidate feature was constant over this sample.
        return push_leaf(nodes, &counts, sample.len());
    };

    let (left_sample, right_sample): (Vec<usize>, Vec<usize>) =
        sample.iter().partition(|&&i| rows[i][feature] <= threshold);
    if left_sample.is_empty() || right_sample.is_empty() {
        return push_leaf(nodes, &counts, sample.len());
    }

    let left = grow(nodes, &left_sample, rows, targets, n_classes, n_features, depth + 1, rng);
    let right = grow(nodes, &right_sample, rows, targets, n_classes, n_features, depth + 1, rng);
    nodes.push(Node::Split { feature, threshold, left, right });
    nodes.len() - 1
}

fn push_leaf(nodes: &mut Vec<Node>, counts: &[usize], total: usize) -> usize {
    let dist = counts.iter().map(|&c| c as f64 / total.max(1) as f64).collect();
    nodes.push(Node::Leaf { dist });
    nodes.len() - 1
}

fn class_counts(sample: &[usize], targets: &[usize], n_classes: usize) -> Vec<usize> {
    let mut counts = vec![0usize; n_classes];
    for &i in sample {
        counts[targets[i]] += 1;
    }
    counts
}

fn gini(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let sum_sq: f64 = counts
        .iter()
        .map(|&c| {
            let p = c as f64 / total as f64;
            p * p
        })
        .sum();
    1.0 - sum_sq
}

/// Best threshold for one feature over the sample: the midpoint between
/// consecutive distinct values minimizing weighted child Gini impurity.
fn best_split(
    sample: &[usize],
    rows: &[Vec<f64>],
    targets: &[usize],
    n_classes: usize,
    feature: usize,
) -> Option<(f64, f64)> {
    let mut ordered: Vec<(f64, usize)> =
        sample.iter().map(|&i| (rows[i][feature], targets[i])).collect();
    ordered.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let total = ordered.len();
    let mut right_counts = vec![0usize; n_classes];
    for &(_, t) in &ordered {
        right_counts[t] += 1;
    }
    let mut left_counts = vec![0usize; n_classes];

    let mut best: Option<(f64, f64)> = None;
    for i in 0..total - 1 {
        let (value, target) = ordered[i];
        left_counts[target] += 1;
        right_counts[target] -= 1;

        let next_value = ordered[i + 1].0;
        if next_value <= value {
            continue;
        }

        let n_left = i + 1;
        let n_right = total - n_left;
        let impurity = (n_left as f64 * gini(&left_counts, n_left)
            + n_right as f64 * gini(&right_counts, n_right))
            / total as f64;

        if best.map_or(true, |(_, b)| impurity < b) {
            best = Some(((value + next_value) / 2.0, impurity));
        }
    }
    best
}
