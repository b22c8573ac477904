pub mod exec;
pub mod grid;

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to (de)serialize: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid mask: {0}")]
    InvalidMask(String),
    #[error("Masks have different dimensions: {0:?} and {1:?}")]
    DimensionMismatch([usize; 3], [usize; 3]),
    #[error("Expected {expected} values, found {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("Failed to spawn scorer: {0}")]
    SpawnScorer(std::io::Error),
    #[error("Failed to communicate with scorer: {0}")]
    ChildError(#[from] std::io::Error),
    #[error("Scorer timeout")]
    ScorerTimeout,
    #[error("Scorer exited with {status:?}: {stderr}")]
    ScorerFailed { status: Option<i32>, stderr: String },
}

/// One searchlight: the voxels around `center` that feed a single unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub center: [usize; 3],
    pub voxels: Vec<[usize; 3]>,
}

/// Dense 3D image in x-fastest order
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Volume {
    pub dims: [usize; 3],
    pub data: Vec<f64>,
}

impl Volume {
    pub fn zeros(dims: [usize; 3]) -> Self {
        Self {
            dims,
            data: vec![0.0; dims.iter().product()],
        }
    }
}

/// Output of scoring a single unit
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct UnitResult {
    pub score: f64,
    #[serde(default)]
    pub weights: Vec<f64>,
}

impl UnitResult {
    /// NaN can't be merged downstream, it is stored as 0.0
    pub fn sanitized_score(&self) -> f64 {
        if self.score.is_nan() {
            0.0
        } else {
            self.score
        }
    }
}

/// Everything a scorer gets to see about one unit
#[derive(Serialize, Debug, Clone)]
pub struct ScoreRequest<'a> {
    pub unit: usize,
    pub center: [usize; 3],
    pub voxels: &'a [[usize; 3]],
    pub labels: &'a [f64],
    pub algorithm: &'a str,
    pub cv: &'a BTreeMap<String, serde_yaml::Value>,
}

/// Source of the ordered unit space and the inverse mapping back to a volume
pub trait UnitProvider: Send + Sync {
    /// selections in global unit order
    fn units(&self) -> &[Selection];

    /// place one value per unit back at the unit's center
    fn inverse_transform(&self, flat: &[f64]) -> Result<Volume, ProviderError>;

    /// read the values at the unit centers, in unit order
    fn select(&self, volume: &Volume) -> Result<Vec<f64>, ProviderError>;
}

/// Per-unit statistical model
pub trait Scorer: Send + Sync {
    fn score_and_weights(&self, request: &ScoreRequest) -> Result<UnitResult, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::UnitResult;

    #[test]
    fn nan_scores_are_zeroed() {
        let nan = UnitResult {
            score: f64::NAN,
            weights: vec![],
        };
        let plain = UnitResult {
            score: -0.25,
            weights: vec![1.0],
        };

        assert_eq!(nan.sanitized_score(), 0.0);
        assert_eq!(plain.sanitized_score(), -0.25);
    }
}
