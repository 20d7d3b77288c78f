//! Principal component analysis via SVD.
//!
//! The observation matrix (rows = snippets, columns = samples) is centered
//! (and optionally standardized) and decomposed directly with
//! [`svd`](crate::linalg::svd); the covariance matrix is never formed.
//! Right singular vectors are the principal axes, `eigenvalue = s^2 / (n-1)`
//! and the training scores are `U * S`.
//!
//! A fitted [`PrincipalComponents`] keeps the column means (and deviations
//! when standardizing) together with the axes, so later snippets are
//! projected into exactly the same feature space.

use serde::{Deserialize, Serialize};

use crate::linalg::{svd, LinalgError, Matrix};

/// Preprocessing applied before decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMethod {
    /// Subtract column means only.
    #[default]
    Center,
    /// Subtract means and divide by column standard deviations.
    Standardize,
}

/// A frozen PCA basis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrincipalComponents {
    method: AnalysisMethod,
    means: Vec<f64>,
    /// Present only for [`AnalysisMethod::Standardize`].
    stds: Option<Vec<f64>>,
    /// Principal axes as columns, variables x components.
    axes: Matrix,
    /// Variance captured by each retained component.
    eigenvalues: Vec<f64>,
    /// Fraction of total variance captured by each retained component.
    explained: Vec<f64>,
}

impl PrincipalComponents {
    /// Fit `components` principal axes to `data`.
    ///
    /// Fails if there are fewer than two observations, if a column is constant
    /// under [`AnalysisMethod::Standardize`], or if the data has fewer than
    /// `components` non-degenerate directions.
    pub fn fit(
        data: &Matrix,
        components: usize,
        method: AnalysisMethod,
    ) -> Result<Self, LinalgError> {
        if data.rows() < 2 {
            return Err(LinalgError::Degenerate(format!(
                "PCA needs at least 2 observations, got {}",
                data.rows()
            )));
        }
        if components == 0 || components > data.cols() {
            return Err(LinalgError::DimensionMismatch(format!(
                "cannot keep {} components of {} variables",
                components,
                data.cols()
            )));
        }

        let means = data.column_means();
        let (prepared, stds) = match method {
            AnalysisMethod::Center => (data.center(&means)?, None),
            AnalysisMethod::Standardize => {
                let stds = data.column_std(&means);
                (data.standardize(&means, &stds)?, Some(stds))
            }
        };

        let dec = svd(&prepared)?;
        if components > dec.singular_values.len() {
            return Err(LinalgError::Degenerate(format!(
                "{} observations cannot span {} components",
                data.rows(),
                components
            )));
        }
        let top = dec.singular_values[0];
        let floor = top * 1e-10;
        if top == 0.0 || dec.singular_values[components - 1] <= floor {
            return Err(LinalgError::Degenerate(format!(
                "data spans fewer than {} independent directions",
                components
            )));
        }

        let dof = (data.rows() - 1) as f64;
        let all_eigen: Vec<f64> = dec.singular_values.iter().map(|s| s * s / dof).collect();
        let total: f64 = all_eigen.iter().sum();
        let eigenvalues: Vec<f64> = all_eigen[..components].to_vec();
        let explained = eigenvalues.iter().map(|e| e / total).collect();

        let mut axes = dec.v.truncate_cols(components);
        orient_axes(&mut axes);

        Ok(Self {
            method,
            means,
            stds,
            axes,
            eigenvalues,
            explained,
        })
    }

    /// Number of retained components.
    pub fn components(&self) -> usize {
        self.axes.cols()
    }

    /// Snippet length the basis was fitted on.
    pub fn input_len(&self) -> usize {
        self.means.len()
    }

    pub fn method(&self) -> AnalysisMethod {
        self.method
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    /// Principal axes as columns.
    pub fn axes(&self) -> &Matrix {
        &self.axes
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    pub fn explained_variance_ratio(&self) -> &[f64] {
        &self.explained
    }

    /// Project one snippet onto the retained axes.
    pub fn project(&self, x: &[f64]) -> Vec<f64> {
        let k = self.components();
        let mut out = vec![0.0; k];
        for (i, (&v, &m)) in x.iter().zip(&self.means).enumerate() {
            let mut z = v - m;
            if let Some(stds) = &self.stds {
                z /= stds[i];
            }
            let axis_row = self.axes.row(i);
            for (o, &a) in out.iter_mut().zip(axis_row) {
                *o += z * a;
            }
        }
        out
    }
}

/// Flip each axis so its largest-magnitude loading is positive
/// (singular-vector signs are otherwise arbitrary).
fn orient_axes(axes: &mut Matrix) {
    for c in 0..axes.cols() {
        let mut pivot = 0.0_f64;
        for r in 0..axes.rows() {
            let v = axes.get(r, c);
            if v.abs() > pivot.abs() {
                pivot = v;
            }
        }
        if pivot < 0.0 {
            for r in 0..axes.rows() {
                let v = axes.get(r, c);
                axes.set(r, c, -v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    /// Points spread along (1, 1, 0) with small isotropic noise.
    fn elongated_cloud(n: usize, seed: u64) -> Matrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let along = Normal::new(0.0, 5.0).unwrap();
        let noise = Normal::new(0.0, 0.1).unwrap();
        let mut data = Vec::with_capacity(n * 3);
        for _ in 0..n {
            let t = along.sample(&mut rng);
            data.push(10.0 + t + noise.sample(&mut rng));
            data.push(-3.0 + t + noise.sample(&mut rng));
            data.push(noise.sample(&mut rng));
        }
        Matrix::from_data(n, 3, data)
    }

    #[test]
    fn test_first_axis_follows_dominant_direction() {
        let data = elongated_cloud(400, 3);
        let pca = PrincipalComponents::fit(&data, 2, AnalysisMethod::Center).unwrap();
        let axis = pca.axes().column(0);
        let inv_sqrt2 = std::f64::consts::FRAC_1_SQRT_2;
        assert!((axis[0] - inv_sqrt2).abs() < 0.02);
        assert!((axis[1] - inv_sqrt2).abs() < 0.02);
        assert!(axis[2].abs() < 0.05);
        assert!(pca.explained_variance_ratio()[0] > 0.99);
        assert!(pca.eigenvalues()[0] > pca.eigenvalues()[1]);
    }

    #[test]
    fn test_projection_matches_svd_scores() {
        let data = elongated_cloud(100, 9);
        let pca = PrincipalComponents::fit(&data, 2, AnalysisMethod::Center).unwrap();
        let centered = data.center(pca.means()).unwrap();
        let dec = svd(&centered).unwrap();
        let scores = dec.scores(2);
        for r in 0..data.rows() {
            let p = pca.project(data.row(r));
            for c in 0..2 {
                // Scores and projection agree up to the sign pinned by orient_axes.
                assert_relative_eq!(p[c].abs(), scores.get(r, c).abs(), epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_refit_is_bitwise_identical() {
        let data = elongated_cloud(200, 11);
        let a = PrincipalComponents::fit(&data, 2, AnalysisMethod::Center).unwrap();
        let b = PrincipalComponents::fit(&data, 2, AnalysisMethod::Center).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_standardize_rejects_constant_column() {
        let data = Matrix::from_data(3, 2, vec![1.0, 4.0, 2.0, 4.0, 3.0, 4.0]);
        let err = PrincipalComponents::fit(&data, 1, AnalysisMethod::Standardize).unwrap_err();
        assert_eq!(err, LinalgError::ZeroVariance { column: 1 });
    }

    #[test]
    fn test_identical_rows_are_degenerate() {
        let data = Matrix::from_data(4, 2, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        assert!(matches!(
            PrincipalComponents::fit(&data, 1, AnalysisMethod::Center),
            Err(LinalgError::Degenerate(_))
        ));
    }

    #[test]
    fn test_fewer_observations_than_components() {
        let data = elongated_cloud(2, 2);
        assert!(matches!(
            PrincipalComponents::fit(&data, 3, AnalysisMethod::Center),
            Err(LinalgError::Degenerate(_))
        ));
    }

    #[test]
    fn test_too_many_components() {
        let data = elongated_cloud(10, 1);
        assert!(PrincipalComponents::fit(&data, 4, AnalysisMethod::Center).is_err());
    }
}
