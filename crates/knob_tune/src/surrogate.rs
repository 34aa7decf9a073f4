//! Surrogate throughput prediction.
//!
//! The artifact is produced offline from the evaluation log and stored as
//! JSON, either as a bare model or as a bundle carrying the global throughput
//! range the model's targets were normalized with. Features are the
//! normalized knob values in catalog order (fixed knobs skipped) followed by
//! the workload's baseline metrics.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::TuneError;
use crate::knobs::{Configuration, KnobCatalog};
use crate::metrics::MetricsSnapshot;

/// Regression tree in flattened array form; node 0 is the root and leaves
/// have `left == -1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub left: Vec<i64>,
    pub right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    pub value: Vec<f64>,
}

impl RegressionTree {
    fn validate(&self, n_features: usize) -> anyhow::Result<()> {
        let nodes = self.value.len();
        anyhow::ensure!(nodes > 0, "tree has no nodes");
        anyhow::ensure!(
            self.left.len() == nodes
                && self.right.len() == nodes
                && self.feature.len() == nodes
                && self.threshold.len() == nodes,
            "tree arrays differ in length"
        );
        for node in 0..nodes {
            if self.left[node] < 0 {
                continue;
            }
            for child in [self.left[node], self.right[node]] {
                // Children always come after their parent, which rules out cycles.
                anyhow::ensure!(
                    child > node as i64 && (child as usize) < nodes,
                    "node {node} has invalid child {child}"
                );
            }
            let feature = self.feature[node];
            anyhow::ensure!(
                feature >= 0 && (feature as usize) < n_features,
                "node {node} splits on feature {feature} of {n_features}"
            );
        }
        Ok(())
    }

    fn predict(&self, features: &[f64]) -> f64 {
        let mut node = 0usize;
        while self.left[node] >= 0 {
            let feature = self.feature[node] as usize;
            node = if features[feature] <= self.threshold[node] {
                self.left[node] as usize
            } else {
                self.right[node] as usize
            };
        }
        self.value[node]
    }
}

/// Supported model families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegressionModel {
    Linear {
        intercept: f64,
        coefficients: Vec<f64>,
    },
    /// Average of the trees' predictions.
    Forest {
        n_features: usize,
        trees: Vec<RegressionTree>,
    },
}

impl RegressionModel {
    pub fn n_features(&self) -> usize {
        match self {
            RegressionModel::Linear { coefficients, .. } => coefficients.len(),
            RegressionModel::Forest { n_features, .. } => *n_features,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        match self {
            RegressionModel::Linear { .. } => Ok(()),
            RegressionModel::Forest { n_features, trees } => {
                anyhow::ensure!(!trees.is_empty(), "forest has no trees");
                for (idx, tree) in trees.iter().enumerate() {
                    tree.validate(*n_features)
                        .with_context(|| format!("tree {idx}"))?;
                }
                Ok(())
            }
        }
    }

    fn predict(&self, features: &[f64]) -> f64 {
        match self {
            RegressionModel::Linear {
                intercept,
                coefficients,
            } => {
                intercept
                    + coefficients
                        .iter()
                        .zip(features)
                        .map(|(c, x)| c * x)
                        .sum::<f64>()
            }
            RegressionModel::Forest { trees, .. } => {
                trees.iter().map(|tree| tree.predict(features)).sum::<f64>() / trees.len() as f64
            }
        }
    }
}

/// Serialized surrogate: a bundle with target range, or a bare model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SurrogateArtifact {
    Bundle {
        model: RegressionModel,
        y_min: f64,
        y_max: f64,
    },
    Bare(RegressionModel),
}

impl SurrogateArtifact {
    pub fn model(&self) -> &RegressionModel {
        match self {
            SurrogateArtifact::Bundle { model, .. } => model,
            SurrogateArtifact::Bare(model) => model,
        }
    }
}

/// Loaded surrogate model.
#[derive(Debug, Clone)]
pub struct SurrogatePredictor {
    artifact: SurrogateArtifact,
}

impl SurrogatePredictor {
    pub fn new(artifact: SurrogateArtifact) -> anyhow::Result<Self> {
        artifact.model().validate().context("invalid surrogate model")?;
        Ok(Self { artifact })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("read surrogate artifact {}", path.display()))?;
        let artifact: SurrogateArtifact = serde_json::from_slice(&raw)
            .with_context(|| format!("parse surrogate artifact {}", path.display()))?;
        let predictor = Self::new(artifact)?;
        tracing::info!(
            path = %path.display(),
            features = predictor.expected_features(),
            bundled = matches!(predictor.artifact, SurrogateArtifact::Bundle { .. }),
            "surrogate loaded"
        );
        Ok(predictor)
    }

    pub fn expected_features(&self) -> usize {
        self.artifact.model().n_features()
    }

    /// Predicts throughput, denormalized with the bundle's range when present.
    pub fn predict(&self, features: &[f64]) -> Result<f64, TuneError> {
        let expected = self.expected_features();
        if features.len() != expected {
            return Err(TuneError::FeatureMismatch {
                expected,
                actual: features.len(),
            });
        }
        let score = self.artifact.model().predict(features);
        Ok(match &self.artifact {
            SurrogateArtifact::Bundle { y_min, y_max, .. } => y_min + score * (y_max - y_min),
            SurrogateArtifact::Bare(_) => score,
        })
    }
}

/// Builds the surrogate feature vector for `config`.
///
/// Knobs are visited in catalog order; knobs missing from `config` take
/// their default, and knobs with `min == max` contribute no feature.
pub fn build_features(
    catalog: &KnobCatalog,
    config: &Configuration,
    baseline: &MetricsSnapshot,
) -> Vec<f64> {
    let mut features = Vec::with_capacity(catalog.len() + baseline.values().len());
    for spec in catalog.iter() {
        let raw = config
            .get(&spec.name)
            .map(|value| value.as_f64())
            .unwrap_or(spec.default);
        if let Some(normalized) = spec.normalize(spec.coerce(raw).as_f64()) {
            features.push(normalized);
        }
    }
    features.extend_from_slice(baseline.values());
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knobs::{KnobKind, KnobSpec, KnobValue};
    use crate::metrics::METRIC_COUNT;

    fn catalog() -> KnobCatalog {
        KnobCatalog::from_specs([
            KnobSpec::new("work_mem", KnobKind::Integer, 0.0, 100.0, 50.0).unwrap(),
            KnobSpec::new("max_connections", KnobKind::Integer, 100.0, 100.0, 100.0).unwrap(),
            KnobSpec::new("effective_io_concurrency", KnobKind::Real, 1.0, 3.0, 1.0).unwrap(),
        ])
    }

    #[test]
    fn fixed_knobs_are_skipped_and_order_is_canonical() {
        let config = Configuration::new()
            .with("work_mem", KnobValue::Integer(25))
            .with("effective_io_concurrency", KnobValue::Real(2.0))
            .with("max_connections", KnobValue::Integer(100));
        let baseline = MetricsSnapshot::from_values([7.0; METRIC_COUNT]);

        let features = build_features(&catalog(), &config, &baseline);

        assert_eq!(features.len(), 2 + METRIC_COUNT);
        assert_eq!(features[0], 0.5); // effective_io_concurrency
        assert_eq!(features[1], 0.25); // work_mem
        assert!(features[2..].iter().all(|v| *v == 7.0));
    }

    #[test]
    fn missing_knobs_use_defaults() {
        let features = build_features(&catalog(), &Configuration::new(), &MetricsSnapshot::zeroed());
        assert_eq!(&features[..2], &[0.0, 0.5]);
    }

    #[test]
    fn bundle_denormalizes_and_bare_passes_through() {
        let model = RegressionModel::Linear {
            intercept: 0.25,
            coefficients: vec![0.5],
        };
        let bundle = SurrogatePredictor::new(SurrogateArtifact::Bundle {
            model: model.clone(),
            y_min: 100.0,
            y_max: 300.0,
        })
        .unwrap();
        let bare = SurrogatePredictor::new(SurrogateArtifact::Bare(model)).unwrap();

        assert_eq!(bundle.predict(&[0.5]).unwrap(), 200.0);
        assert_eq!(bare.predict(&[0.5]).unwrap(), 0.5);
    }

    #[test]
    fn both_artifact_forms_parse() {
        let bundle: SurrogateArtifact = serde_json::from_str(
            r#"{"model": {"kind": "linear", "intercept": 0.0, "coefficients": [1.0]}, "y_min": 1.0, "y_max": 2.0}"#,
        )
        .unwrap();
        assert!(matches!(bundle, SurrogateArtifact::Bundle { .. }));
        let bare: SurrogateArtifact =
            serde_json::from_str(r#"{"kind": "linear", "intercept": 0.0, "coefficients": [1.0]}"#).unwrap();
        assert!(matches!(bare, SurrogateArtifact::Bare(_)));
    }

    #[test]
    fn forest_averages_tree_predictions() {
        let stump = |threshold: f64, low: f64, high: f64| RegressionTree {
            left: vec![1, -1, -1],
            right: vec![2, -1, -1],
            feature: vec![0, -2, -2],
            threshold: vec![threshold, -2.0, -2.0],
            value: vec![0.0, low, high],
        };
        let predictor = SurrogatePredictor::new(SurrogateArtifact::Bare(RegressionModel::Forest {
            n_features: 2,
            trees: vec![stump(0.5, 0.0, 1.0), stump(0.2, 0.2, 0.6)],
        }))
        .unwrap();

        assert!((predictor.predict(&[0.1, 9.0]).unwrap() - 0.1).abs() < 1e-12);
        assert!((predictor.predict(&[0.9, 9.0]).unwrap() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn feature_count_mismatch_is_reported() {
        let predictor = SurrogatePredictor::new(SurrogateArtifact::Bare(RegressionModel::Linear {
            intercept: 0.0,
            coefficients: vec![1.0, 1.0],
        }))
        .unwrap();
        assert!(matches!(
            predictor.predict(&[1.0]),
            Err(TuneError::FeatureMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn malformed_trees_are_rejected() {
        let cyclic = RegressionTree {
            left: vec![0],
            right: vec![0],
            feature: vec![0],
            threshold: vec![0.0],
            value: vec![1.0],
        };
        let artifact = SurrogateArtifact::Bare(RegressionModel::Forest {
            n_features: 1,
            trees: vec![cyclic],
        });
        assert!(SurrogatePredictor::new(artifact).is_err());
    }
}
