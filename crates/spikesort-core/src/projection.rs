//! # Feature Projection
//!
//! Maps same-length spike snippets of one channel to small feature vectors.
//!
//! | Mode               | Feature                                   | Dimension |
//! |--------------------|-------------------------------------------|-----------|
//! | `single-inflection`| sample at the peak index                  | 1         |
//! | `dual-inflection`  | samples at the peak and at peak + delay   | 2         |
//! | `pca`              | scores on the leading principal axes      | configured|
//! | `haar`             | leading coarse-to-fine Haar coefficients  | configured|
//!
//! [`ProjectionMode`] is the configuration tag. [`Projection::fit`] turns it
//! into a fitted strategy carrying everything needed to project later
//! snippets identically: the sample indices for the inflection modes, the
//! full PCA basis for `pca`. Classification always goes through the fitted
//! strategy of the training pass.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::linalg::{LinalgError, Matrix};
use crate::pca::{AnalysisMethod, PrincipalComponents};
use crate::wavelet::HaarTransform;

/// How snippets are reduced to features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectionMode {
    #[serde(alias = "maximum voltage inflection")]
    SingleInflection,
    #[serde(alias = "double voltage inflection")]
    DualInflection,
    #[default]
    #[serde(alias = "PCA")]
    Pca,
    #[serde(alias = "haar wavelet")]
    Haar,
}

impl ProjectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionMode::SingleInflection => "single-inflection",
            ProjectionMode::DualInflection => "dual-inflection",
            ProjectionMode::Pca => "pca",
            ProjectionMode::Haar => "haar",
        }
    }

    /// Whether the feature dimension comes from configuration.
    pub fn uses_dimension(&self) -> bool {
        matches!(self, ProjectionMode::Pca | ProjectionMode::Haar)
    }
}

impl fmt::Display for ProjectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognised projection mode name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown projection mode '{0}'")]
pub struct UnknownProjectionMode(pub String);

impl FromStr for ProjectionMode {
    type Err = UnknownProjectionMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "single-inflection" | "maximum-voltage-inflection" | "peak" => {
                Ok(ProjectionMode::SingleInflection)
            }
            "dual-inflection" | "double-voltage-inflection" => Ok(ProjectionMode::DualInflection),
            "pca" => Ok(ProjectionMode::Pca),
            "haar" | "haar-wavelet" => Ok(ProjectionMode::Haar),
            _ => Err(UnknownProjectionMode(s.to_string())),
        }
    }
}

/// Resolved projection parameters for one training pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionParams {
    pub mode: ProjectionMode,
    pub snippet_len: usize,
    pub peak_sample: usize,
    /// Second sample for dual inflection, already converted from milliseconds.
    pub second_sample: usize,
    /// Output dimension for PCA and Haar.
    pub dimension: usize,
}

/// Sample offset of `delay_ms` at `sample_rate_hz`, rounded to the nearest sample.
pub fn delay_in_samples(sample_rate_hz: f64, delay_ms: f64) -> usize {
    (sample_rate_hz * delay_ms / 1000.0).round().max(0.0) as usize
}

/// A projection fitted to one channel's training snippets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Projection {
    SingleInflection {
        peak: usize,
    },
    DualInflection {
        peak: usize,
        second: usize,
    },
    Pca {
        basis: PrincipalComponents,
    },
    Haar {
        transform: HaarTransform,
        dimension: usize,
    },
}

impl Projection {
    /// Fit the configured strategy to `snippets` (rows = snippets).
    pub fn fit(params: &ProjectionParams, snippets: &Matrix) -> Result<Self, LinalgError> {
        if snippets.rows() == 0 {
            return Err(LinalgError::Degenerate(
                "cannot fit a projection to zero snippets".to_string(),
            ));
        }
        if snippets.cols() != params.snippet_len {
            return Err(LinalgError::DimensionMismatch(format!(
                "snippets have {} samples, expected {}",
                snippets.cols(),
                params.snippet_len
            )));
        }
        check_index(params.peak_sample, params.snippet_len)?;

        match params.mode {
            ProjectionMode::SingleInflection => Ok(Projection::SingleInflection {
                peak: params.peak_sample,
            }),
            ProjectionMode::DualInflection => {
                check_index(params.second_sample, params.snippet_len)?;
                Ok(Projection::DualInflection {
                    peak: params.peak_sample,
                    second: params.second_sample,
                })
            }
            ProjectionMode::Pca => {
                let basis =
                    PrincipalComponents::fit(snippets, params.dimension, AnalysisMethod::Center)?;
                Ok(Projection::Pca { basis })
            }
            ProjectionMode::Haar => {
                if params.dimension == 0 || params.dimension > params.snippet_len {
                    return Err(LinalgError::DimensionMismatch(format!(
                        "cannot keep {} Haar coefficients of {} samples",
                        params.dimension, params.snippet_len
                    )));
                }
                Ok(Projection::Haar {
                    transform: HaarTransform::full_depth(),
                    dimension: params.dimension,
                })
            }
        }
    }

    pub fn mode(&self) -> ProjectionMode {
        match self {
            Projection::SingleInflection { .. } => ProjectionMode::SingleInflection,
            Projection::DualInflection { .. } => ProjectionMode::DualInflection,
            Projection::Pca { .. } => ProjectionMode::Pca,
            Projection::Haar { .. } => ProjectionMode::Haar,
        }
    }

    /// Feature dimension.
    pub fn dimension(&self) -> usize {
        match self {
            Projection::SingleInflection { .. } => 1,
            Projection::DualInflection { .. } => 2,
            Projection::Pca { basis } => basis.components(),
            Projection::Haar { dimension, .. } => *dimension,
        }
    }

    /// Whether snippets of `len` samples can be projected.
    pub fn accepts_len(&self, len: usize) -> bool {
        match self {
            Projection::SingleInflection { peak } => *peak < len,
            Projection::DualInflection { peak, second } => *peak < len && *second < len,
            Projection::Pca { basis } => basis.input_len() == len,
            Projection::Haar { dimension, .. } => *dimension <= len,
        }
    }

    /// Project one snippet. The caller guarantees the snippet length.
    pub fn project(&self, snippet: &[f64]) -> Vec<f64> {
        match self {
            Projection::SingleInflection { peak } => vec![snippet[*peak]],
            Projection::DualInflection { peak, second } => vec![snippet[*peak], snippet[*second]],
            Projection::Pca { basis } => basis.project(snippet),
            Projection::Haar {
                transform,
                dimension,
            } => transform.leading_coefficients(snippet, *dimension),
        }
    }

    /// Project every row of `snippets` into a feature matrix.
    pub fn project_all(&self, snippets: &Matrix) -> Matrix {
        let dim = self.dimension();
        let mut data = Vec::with_capacity(snippets.rows() * dim);
        for row in snippets.row_iter() {
            data.extend(self.project(row));
        }
        Matrix::from_data(snippets.rows(), dim, data)
    }
}

fn check_index(index: usize, len: usize) -> Result<(), LinalgError> {
    if index >= len {
        return Err(LinalgError::DimensionMismatch(format!(
            "sample index {} outside a {}-sample snippet",
            index, len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn params(mode: ProjectionMode) -> ProjectionParams {
        ProjectionParams {
            mode,
            snippet_len: 8,
            peak_sample: 2,
            second_sample: 5,
            dimension: 2,
        }
    }

    fn ramp_snippets(n: usize, seed: u64) -> Matrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let amp = Normal::new(1.0, 0.4).unwrap();
        let noise = Normal::new(0.0, 0.05).unwrap();
        let mut data = Vec::with_capacity(n * 8);
        for _ in 0..n {
            let a = amp.sample(&mut rng);
            for s in 0..8 {
                data.push(a * (s as f64 - 3.0) + noise.sample(&mut rng));
            }
        }
        Matrix::from_data(n, 8, data)
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("pca".parse::<ProjectionMode>().unwrap(), ProjectionMode::Pca);
        assert_eq!(
            "Maximum Voltage Inflection".parse::<ProjectionMode>().unwrap(),
            ProjectionMode::SingleInflection
        );
        assert_eq!(
            "double voltage inflection".parse::<ProjectionMode>().unwrap(),
            ProjectionMode::DualInflection
        );
        assert_eq!("haar wavelet".parse::<ProjectionMode>().unwrap(), ProjectionMode::Haar);
        assert!("fourier".parse::<ProjectionMode>().is_err());
    }

    #[test]
    fn test_mode_serde_tag() {
        let yaml = serde_yaml::to_string(&ProjectionMode::DualInflection).unwrap();
        assert_eq!(yaml.trim(), "dual-inflection");
        let legacy: ProjectionMode = serde_yaml::from_str("haar wavelet").unwrap();
        assert_eq!(legacy, ProjectionMode::Haar);
    }

    #[test]
    fn test_delay_in_samples() {
        assert_eq!(delay_in_samples(25_000.0, 0.2), 5);
        assert_eq!(delay_in_samples(30_000.0, 0.25), 8);
        assert_eq!(delay_in_samples(25_000.0, 0.0), 0);
    }

    #[test]
    fn test_inflection_features() {
        let snippets = ramp_snippets(4, 1);
        let single = Projection::fit(&params(ProjectionMode::SingleInflection), &snippets).unwrap();
        let dual = Projection::fit(&params(ProjectionMode::DualInflection), &snippets).unwrap();
        assert_eq!(single.dimension(), 1);
        assert_eq!(dual.dimension(), 2);

        let features = dual.project_all(&snippets);
        assert_eq!(features.rows(), 4);
        for r in 0..4 {
            assert_eq!(features.get(r, 0), snippets.get(r, 2));
            assert_eq!(features.get(r, 1), snippets.get(r, 5));
        }
    }

    #[test]
    fn test_second_index_out_of_range() {
        let mut p = params(ProjectionMode::DualInflection);
        p.second_sample = 8;
        assert!(Projection::fit(&p, &ramp_snippets(3, 2)).is_err());
    }

    #[test]
    fn test_pca_basis_is_frozen() {
        let training = ramp_snippets(50, 3);
        let projection = Projection::fit(&params(ProjectionMode::Pca), &training).unwrap();
        let trained = projection.project_all(&training);

        // Projecting the same snippets alongside unrelated ones must not move
        // their features.
        let mut rows: Vec<Vec<f64>> = training.row_iter().map(|r| r.to_vec()).collect();
        rows.push(vec![100.0; 8]);
        let mixed = Matrix::from_rows(&rows).unwrap();
        let again = projection.project_all(&mixed);
        for r in 0..training.rows() {
            assert_eq!(trained.row(r), again.row(r));
        }
    }

    #[test]
    fn test_haar_features() {
        let snippets = Matrix::from_data(1, 8, vec![1.0; 8]);
        let projection = Projection::fit(&params(ProjectionMode::Haar), &snippets).unwrap();
        let f = projection.project(snippets.row(0));
        assert_eq!(f.len(), 2);
        // Constant snippet: all energy in the approximation.
        assert_relative_eq!(f[0], 8.0_f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(f[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rejects_empty_and_wrong_length() {
        let p = params(ProjectionMode::SingleInflection);
        assert!(Projection::fit(&p, &Matrix::new(0, 8)).is_err());
        assert!(Projection::fit(&p, &Matrix::new(3, 6)).is_err());
    }

    #[test]
    fn test_accepted_lengths() {
        let training = ramp_snippets(20, 9);
        let dual = Projection::fit(&params(ProjectionMode::DualInflection), &training).unwrap();
        assert!(dual.accepts_len(8));
        assert!(dual.accepts_len(6));
        assert!(!dual.accepts_len(5));

        let pca = Projection::fit(&params(ProjectionMode::Pca), &training).unwrap();
        assert!(pca.accepts_len(8));
        assert!(!pca.accepts_len(9));
    }
}
