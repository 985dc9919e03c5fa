//! Gradient-boosted regression trees under the Cox partial likelihood.
//!
//! Each boosting pass fits one depth-limited least-squares tree to the martingale
//! residuals of the current ensemble and adds it with shrinkage. The ensemble's
//! summed output is the log-risk score.

use super::{RawPrediction, SurvivalModel, TrainingError, TrainingPass};
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

/// Nodes are stored flat with the root at index 0; children always follow their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

struct GrowSettings {
    max_depth: usize,
    min_samples_leaf: usize,
}

impl RegressionTree {
    pub fn fit(
        features: ArrayView2<'_, f64>,
        targets: ArrayView1<'_, f64>,
        max_depth: usize,
        min_samples_leaf: usize,
    ) -> Self {
        let settings = GrowSettings {
            max_depth,
            min_samples_leaf: min_samples_leaf.max(1),
        };
        let mut nodes = Vec::new();
        let indices: Vec<usize> = (0..targets.len()).collect();
        grow(&mut nodes, features, targets, indices, 0, &settings);
        Self { nodes }
    }

    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut idx = 0;
        // A well-formed tree reaches a leaf in at most `nodes.len()` hops.
        for _ in 0..=self.nodes.len() {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { value }) => return *value,
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = row.get(*feature).copied().unwrap_or(f64::NAN);
                    idx = if value <= *threshold { *left } else { *right };
                }
                None => return f64::NAN,
            }
        }
        f64::NAN
    }

    fn is_well_formed(&self, n_features: usize) -> bool {
        !self.nodes.is_empty()
            && self.nodes.iter().enumerate().all(|(idx, node)| match node {
                TreeNode::Leaf { value } => value.is_finite(),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    *feature < n_features
                        && threshold.is_finite()
                        && *left > idx
                        && *right > idx
                        && *left < self.nodes.len()
                        && *right < self.nodes.len()
                }
            })
    }
}

fn mean_of(targets: ArrayView1<'_, f64>, indices: &[usize]) -> f64 {
    if indices.is_empty() {
        return 0.0;
    }
    indices.iter().map(|&i| targets[i]).sum::<f64>() / indices.len() as f64
}

fn grow(
    nodes: &mut Vec<TreeNode>,
    features: ArrayView2<'_, f64>,
    targets: ArrayView1<'_, f64>,
    indices: Vec<usize>,
    depth: usize,
    settings: &GrowSettings,
) -> usize {
    let node_id = nodes.len();
    nodes.push(TreeNode::Leaf {
        value: mean_of(targets, &indices),
    });
    if depth >= settings.max_depth || indices.len() < 2 * settings.min_samples_leaf {
        return node_id;
    }
    let Some(split) = best_split(features, targets, &indices, settings.min_samples_leaf) else {
        return node_id;
    };

    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = indices
        .into_iter()
        .partition(|&i| features[[i, split.feature]] <= split.threshold);
    let left = grow(nodes, features, targets, left_rows, depth + 1, settings);
    let right = grow(nodes, features, targets, right_rows, depth + 1, settings);
    nodes[node_id] = TreeNode::Split {
        feature: split.feature,
        threshold: split.threshold,
        left,
        right,
    };
    node_id
}

/// Largest reduction in squared error over all features and midpoints.
fn best_split(
    features: ArrayView2<'_, f64>,
    targets: ArrayView1<'_, f64>,
    indices: &[usize],
    min_samples_leaf: usize,
) -> Option<SplitCandidate> {
    let n = indices.len();
    let total: f64 = indices.iter().map(|&i| targets[i]).sum();
    let parent_score = total * total / n as f64;
    let mut best: Option<SplitCandidate> = None;

    for feature in 0..features.ncols() {
        let mut sorted = indices.to_vec();
        sorted.sort_by(|&a, &b| features[[a, feature]].total_cmp(&features[[b, feature]]));

        let mut left_sum = 0.0;
        for k in 0..n - 1 {
            left_sum += targets[sorted[k]];
            let here = features[[sorted[k], feature]];
            let next = features[[sorted[k + 1], feature]];
            let left_count = k + 1;
            let right_count = n - left_count;
            if here == next || left_count < min_samples_leaf || right_count < min_samples_leaf {
                continue;
            }
            let right_sum = total - left_sum;
            let gain = left_sum * left_sum / left_count as f64
                + right_sum * right_sum / right_count as f64
                - parent_score;
            if gain > 1e-12 && best.as_ref().is_none_or(|b| gain > b.gain) {
                best = Some(SplitCandidate {
                    feature,
                    threshold: 0.5 * (here + next),
                    gain,
                });
            }
        }
    }
    best
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostedEnsemble {
    pub n_features: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub trees: Vec<RegressionTree>,
}

impl BoostedEnsemble {
    pub fn new(
        n_features: usize,
        learning_rate: f64,
        max_depth: usize,
        min_samples_leaf: usize,
    ) -> Self {
        Self {
            n_features,
            learning_rate,
            max_depth,
            min_samples_leaf,
            trees: Vec::new(),
        }
    }

    pub fn scores(&self, features: ArrayView2<'_, f64>) -> Array1<f64> {
        features
            .rows()
            .into_iter()
            .map(|row| {
                self.trees
                    .iter()
                    .map(|tree| self.learning_rate * tree.predict_row(row))
                    .sum::<f64>()
            })
            .collect()
    }
}

impl SurvivalModel for BoostedEnsemble {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn is_fitted(&self) -> bool {
        self.n_features > 0
    }

    fn parameters_finite(&self) -> bool {
        self.learning_rate.is_finite()
            && self
                .trees
                .iter()
                .all(|tree| tree.is_well_formed(self.n_features))
    }

    fn raw_predict(&self, features: ArrayView2<'_, f64>) -> RawPrediction {
        RawPrediction::Scores(self.scores(features))
    }

    /// Adds one tree fit to the current martingale residuals.
    fn train_pass(&mut self, pass: &mut TrainingPass<'_>) -> Result<(), TrainingError> {
        let features = pass.cohort.features();
        let current = self.scores(features);
        let residuals = pass
            .loss
            .residuals(current.view(), pass.cohort.time(), pass.cohort.event());
        let tree = RegressionTree::fit(
            features,
            residuals.view(),
            self.max_depth,
            self.min_samples_leaf,
        );
        self.trees.push(tree);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn tree_recovers_a_step_function() {
        let features = array![[0.0, 5.0], [0.0, 1.0], [1.0, 4.0], [1.0, 2.0]];
        let targets = array![-1.0, -1.0, 2.0, 2.0];
        let tree = RegressionTree::fit(features.view(), targets.view(), 2, 1);

        assert!(matches!(tree.nodes[0], TreeNode::Split { feature: 0, .. }));
        for (row, want) in features.rows().into_iter().zip(targets.iter()) {
            assert_eq!(tree.predict_row(row), *want);
        }
        assert!(tree.is_well_formed(2));
    }

    #[test]
    fn depth_zero_is_a_single_mean_leaf() {
        let features = array![[0.0], [1.0], [2.0]];
        let targets = array![1.0, 2.0, 6.0];
        let tree = RegressionTree::fit(features.view(), targets.view(), 0, 1);
        assert_eq!(tree.nodes, vec![TreeNode::Leaf { value: 3.0 }]);
    }

    #[test]
    fn min_leaf_size_blocks_small_splits() {
        let features = array![[0.0], [1.0], [2.0]];
        let targets = array![10.0, 0.0, 0.0];
        let tree = RegressionTree::fit(features.view(), targets.view(), 3, 2);
        assert_eq!(tree.nodes.len(), 1);
    }

    #[test]
    fn malformed_trees_are_detected() {
        let cyclic = RegressionTree {
            nodes: vec![TreeNode::Split {
                feature: 0,
                threshold: 0.5,
                left: 0,
                right: 0,
            }],
        };
        assert!(!cyclic.is_well_formed(1));
        assert!(cyclic.predict_row(array![0.0].view()).is_nan());
    }
}
