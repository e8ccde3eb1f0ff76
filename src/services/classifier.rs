//! End-use classifier interface and a gradient-boosted tree implementation
//!
//! The tree model is read from a LightGBM JSON dump (`Booster.dump_model()`).
//! Only numerical `<=` splits are supported; anything else is rejected when
//! the model is loaded so a bad artifact stops the service at startup.

use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Failures while predicting a single row
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifierError {
    #[error("expected {expected} features, got {got}")]
    RowWidth { expected: usize, got: usize },
    #[error("model produced no class scores")]
    NoScores,
}

/// Failures while loading a model artifact
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("cannot read model {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse model: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported decision type {0:?}")]
    UnsupportedDecision(String),
    #[error("split on feature {index} but model declares {declared} features")]
    FeatureOutOfRange { index: usize, declared: usize },
    #[error("model has {model} classes but {labels} labels were configured")]
    ClassCount { model: usize, labels: usize },
    #[error("model declares no features")]
    NoFeatures,
    #[error("model has no trees")]
    NoTrees,
}

/// A fitted model mapping one feature row to one label
///
/// Implementations declare the column order they were trained with; callers
/// resolve that order once and pass rows laid out accordingly.
pub trait Classifier: Send + Sync {
    /// Feature names in the order `predict` expects them
    fn feature_names(&self) -> &[String];

    /// Predict the label for one row
    fn predict(&self, row: &[f64]) -> Result<String, ClassifierError>;
}

#[derive(Debug, Deserialize)]
struct ModelDump {
    #[serde(default = "default_trees_per_iteration")]
    num_tree_per_iteration: usize,
    feature_names: Vec<String>,
    tree_info: Vec<TreeInfo>,
}

fn default_trees_per_iteration() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct TreeInfo {
    tree_structure: Node,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Node {
    Split {
        split_feature: usize,
        threshold: f64,
        #[serde(default = "default_decision_type")]
        decision_type: String,
        #[serde(default)]
        default_left: bool,
        #[serde(default = "default_missing_type")]
        missing_type: String,
        left_child: Box<Node>,
        right_child: Box<Node>,
    },
    Leaf {
        leaf_value: f64,
    },
}

fn default_decision_type() -> String {
    "<=".to_string()
}

fn default_missing_type() -> String {
    "None".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Missing {
    None,
    Zero,
    NaN,
}

/// Flattened tree node; children are indices into the owning tree
#[derive(Debug, Clone)]
enum TreeNode {
    Split { feature: usize, threshold: f64, default_left: bool, missing: Missing, left: usize, right: usize },
    Leaf(f64),
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<TreeNode>,
}

const ZERO_THRESHOLD: f64 = 1e-35;

impl Tree {
    fn from_dump(root: Node, declared: usize) -> Result<Self, ModelError> {
        let mut nodes = Vec::new();
        Self::flatten(root, declared, &mut nodes)?;
        Ok(Self { nodes })
    }

    fn flatten(node: Node, declared: usize, nodes: &mut Vec<TreeNode>) -> Result<usize, ModelError> {
        let index = nodes.len();
        match node {
            Node::Leaf { leaf_value } => nodes.push(TreeNode::Leaf(leaf_value)),
            Node::Split {
                split_feature,
                threshold,
                decision_type,
                default_left,
                missing_type,
                left_child,
                right_child,
            } => {
                if decision_type != "<=" {
                    return Err(ModelError::UnsupportedDecision(decision_type));
                }
                if split_feature >= declared {
                    return Err(ModelError::FeatureOutOfRange { index: split_feature, declared });
                }
                let missing = match missing_type.as_str() {
                    "Zero" => Missing::Zero,
                    "NaN" => Missing::NaN,
                    _ => Missing::None,
                };
                // Placeholder until both children have indices
                nodes.push(TreeNode::Leaf(0.0));
                let left = Self::flatten(*left_child, declared, nodes)?;
                let right = Self::flatten(*right_child, declared, nodes)?;
                nodes[index] = TreeNode::Split {
                    feature: split_feature,
                    threshold,
                    default_left,
                    missing,
                    left,
                    right,
                };
            }
        }
        Ok(index)
    }

    fn score(&self, row: &[f64]) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Leaf(value) => return *value,
                TreeNode::Split { feature, threshold, default_left, missing, left, right } => {
                    let mut value = row[*feature];
                    let is_missing = match missing {
                        Missing::NaN => value.is_nan(),
                        Missing::Zero => value.is_nan() || value.abs() <= ZERO_THRESHOLD,
                        Missing::None => {
                            if value.is_nan() {
                                value = 0.0;
                            }
                            false
                        }
                    };
                    let go_left = if is_missing { *default_left } else { value <= *threshold };
                    index = if go_left { *left } else { *right };
                }
            }
        }
    }
}

/// Gradient-boosted tree ensemble loaded from a LightGBM JSON dump
#[derive(Debug, Clone)]
pub struct TreeEnsemble {
    feature_names: Vec<String>,
    labels: Vec<String>,
    trees_per_iteration: usize,
    trees: Vec<Tree>,
}

impl TreeEnsemble {
    /// Read a model file; `labels` are the class labels in class-index order
    pub fn load<P: AsRef<Path>>(path: P, labels: &[String]) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|source| ModelError::Read { path: path.display().to_string(), source })?;
        Self::from_json(&content, labels)
    }

    pub fn from_json(json: &str, labels: &[String]) -> Result<Self, ModelError> {
        let dump: ModelDump = serde_json::from_str(json)?;

        if dump.feature_names.is_empty() {
            return Err(ModelError::NoFeatures);
        }
        if dump.tree_info.is_empty() {
            return Err(ModelError::NoTrees);
        }

        let trees_per_iteration = dump.num_tree_per_iteration.max(1);
        // A single tree per iteration is a binary model with two classes
        let classes = if trees_per_iteration == 1 { 2 } else { trees_per_iteration };
        if classes != labels.len() {
            return Err(ModelError::ClassCount { model: classes, labels: labels.len() });
        }

        let declared = dump.feature_names.len();
        let trees = dump
            .tree_info
            .into_iter()
            .map(|info| Tree::from_dump(info.tree_structure, declared))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            feature_names: dump.feature_names,
            labels: labels.to_vec(),
            trees_per_iteration,
            trees,
        })
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Raw (pre-link) score per tree group
    fn raw_scores(&self, row: &[f64]) -> Vec<f64> {
        let mut scores = vec![0.0; self.trees_per_iteration];
        for (i, tree) in self.trees.iter().enumerate() {
            scores[i % self.trees_per_iteration] += tree.score(row);
        }
        scores
    }
}

impl Classifier for TreeEnsemble {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict(&self, row: &[f64]) -> Result<String, ClassifierError> {
        if row.len() != self.feature_names.len() {
            return Err(ClassifierError::RowWidth {
                expected: self.feature_names.len(),
                got: row.len(),
            });
        }

        let scores = self.raw_scores(row);
        let class = if self.trees_per_iteration == 1 {
            // sigmoid(raw) > 0.5
            usize::from(scores[0] > 0.0)
        } else {
            scores
                .iter()
                .enumerate()
                .fold(None, |best: Option<(usize, f64)>, (i, &score)| match best {
                    Some((_, top)) if top >= score => best,
                    _ => Some((i, score)),
                })
                .map(|(i, _)| i)
                .ok_or(ClassifierError::NoScores)?
        };

        self.labels.get(class).cloned().ok_or(ClassifierError::NoScores)
    }
}
