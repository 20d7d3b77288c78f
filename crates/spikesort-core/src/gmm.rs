//! Multivariate Gaussian mixture fitted with Expectation-Maximization.
//!
//! Full covariance per component. Initialization is k-means++ seeding followed
//! by a few Lloyd iterations, all driven by a seeded [`StdRng`] so a fit is a
//! pure function of `(features, k, config, seed)`. The E-step works in the log
//! domain (log-sum-exp over components) so far-away points never underflow to
//! an all-zero responsibility row.
//!
//! Failures are reported as [`FitError`] and are local to one candidate order:
//! the caller decides whether another `k` is worth trying.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::linalg::{symmetric_eigen, EigenResult, LinalgError, Matrix};

/// ln(2π)
const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Why a mixture of a given order could not be fitted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("need at least {needed} observations, got {got}")]
    TooFewObservations { needed: usize, got: usize },

    #[error("covariance of component {component} is singular")]
    SingularCovariance { component: usize },

    #[error("component {component} collapsed (weight {weight:.4})")]
    EmptyComponent { component: usize, weight: f64 },

    #[error("EM did not converge within {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("non-finite {0}")]
    NonFinite(&'static str),

    #[error("no mixture order between 1 and {max_k} could be fitted")]
    NoValidOrder { max_k: usize },
}

/// EM tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmConfig {
    pub max_iterations: usize,
    /// Convergence threshold on the change of mean per-observation log-likelihood.
    pub tolerance: f64,
    /// Added to every covariance diagonal.
    pub regularization: f64,
    pub kmeans_iterations: usize,
    /// Smallest mixing weight a component may end with.
    pub min_component_weight: f64,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-6,
            regularization: 1e-6,
            kmeans_iterations: 20,
            min_component_weight: 0.02,
        }
    }
}

/// One Gaussian component with its cached Cholesky factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianComponent {
    weight: f64,
    mean: Vec<f64>,
    covariance: Matrix,
    cholesky: Matrix,
    log_det: f64,
}

impl GaussianComponent {
    /// Fails if `covariance` is not positive definite.
    pub fn new(weight: f64, mean: Vec<f64>, covariance: Matrix) -> Result<Self, LinalgError> {
        if covariance.rows() != mean.len() {
            return Err(LinalgError::DimensionMismatch(format!(
                "mean has {} entries but covariance is {}x{}",
                mean.len(),
                covariance.rows(),
                covariance.cols()
            )));
        }
        let cholesky = covariance.cholesky()?;
        let log_det = 2.0 * (0..cholesky.rows()).map(|i| cholesky.get(i, i).ln()).sum::<f64>();
        Ok(Self {
            weight,
            mean,
            covariance,
            cholesky,
            log_det,
        })
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn covariance(&self) -> &Matrix {
        &self.covariance
    }

    /// Squared Mahalanobis distance of `x` from the component mean.
    pub fn mahalanobis_sq(&self, x: &[f64]) -> f64 {
        let diff: Vec<f64> = x.iter().zip(&self.mean).map(|(a, m)| a - m).collect();
        let z = self.cholesky.forward_substitute(&diff);
        z.iter().map(|v| v * v).sum()
    }

    /// Log density of the (unweighted) normal at `x`.
    pub fn log_pdf(&self, x: &[f64]) -> f64 {
        let d = self.mean.len() as f64;
        -0.5 * (d * LN_2PI + self.log_det + self.mahalanobis_sq(x))
    }

    /// Axes of the component's covariance ellipsoid, largest variance first.
    pub fn principal_axes(&self) -> Result<EigenResult, LinalgError> {
        symmetric_eigen(&self.covariance)
    }
}

/// Number of free parameters of a `k`-component, `d`-dimensional
/// full-covariance mixture.
pub fn free_parameters(k: usize, d: usize) -> usize {
    k * (d + d * (d + 1) / 2) + k.saturating_sub(1)
}

/// A fitted Gaussian mixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianMixture {
    components: Vec<GaussianComponent>,
    dimension: usize,
    /// Total log-likelihood of the training data.
    log_likelihood: f64,
    observations: usize,
    iterations: usize,
}

impl GaussianMixture {
    /// Fit `k` components to the rows of `features`.
    pub fn fit(features: &Matrix, k: usize, config: &EmConfig, seed: u64) -> Result<Self, FitError> {
        let n = features.rows();
        let d = features.cols();
        let needed = (k.max(1) * (d + 1)).max(2);
        if k == 0 || d == 0 || n < needed {
            return Err(FitError::TooFewObservations { needed, got: n });
        }
        if features.as_slice().iter().any(|v| !v.is_finite()) {
            return Err(FitError::NonFinite("feature value"));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let assignments = kmeans(features, k, config.kmeans_iterations, &mut rng);
        let mut components = initial_components(features, &assignments, k, config.regularization)?;

        let mut resp = vec![0.0; n * k];
        let mut prev = f64::NEG_INFINITY;
        let mut mean_ll = f64::NEG_INFINITY;
        let mut iterations = 0;
        let mut converged = false;

        for iter in 0..config.max_iterations {
            mean_ll = e_step(features, &components, &mut resp) / n as f64;
            if !mean_ll.is_finite() {
                return Err(FitError::NonFinite("log-likelihood"));
            }
            iterations = iter + 1;
            if iter > 0 && (mean_ll - prev).abs() < config.tolerance {
                converged = true;
                break;
            }
            prev = mean_ll;
            components = m_step(features, &resp, k, config.regularization)?;
        }

        if !converged {
            return Err(FitError::NotConverged {
                iterations: config.max_iterations,
            });
        }

        for (j, c) in components.iter().enumerate() {
            if c.weight < config.min_component_weight {
                return Err(FitError::EmptyComponent {
                    component: j,
                    weight: c.weight,
                });
            }
        }

        Ok(Self {
            components,
            dimension: d,
            log_likelihood: mean_ll * n as f64,
            observations: n,
            iterations,
        })
    }

    pub fn components(&self) -> &[GaussianComponent] {
        &self.components
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn observations(&self) -> usize {
        self.observations
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn num_params(&self) -> usize {
        free_parameters(self.components.len(), self.dimension)
    }

    /// Bayesian information criterion (lower is better).
    pub fn bic(&self) -> f64 {
        -2.0 * self.log_likelihood + self.num_params() as f64 * (self.observations as f64).ln()
    }

    /// Akaike information criterion (lower is better).
    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.num_params() as f64
    }

    /// Weighted log density of each component at `x`.
    fn joint_log(&self, x: &[f64]) -> Vec<f64> {
        self.components
            .iter()
            .map(|c| c.weight.ln() + c.log_pdf(x))
            .collect()
    }

    /// Mixture log density at `x`.
    pub fn log_density(&self, x: &[f64]) -> f64 {
        log_sum_exp(&self.joint_log(x))
    }

    /// Posterior responsibility of each component for `x`.
    pub fn posterior(&self, x: &[f64]) -> Vec<f64> {
        let joint = self.joint_log(x);
        let lse = log_sum_exp(&joint);
        joint.iter().map(|l| (l - lse).exp()).collect()
    }

    /// Most responsible component and its posterior.
    pub fn predict(&self, x: &[f64]) -> (usize, f64) {
        let post = self.posterior(x);
        let mut best = 0;
        for (j, &p) in post.iter().enumerate().skip(1) {
            if p > post[best] {
                best = j;
            }
        }
        (best, post[best])
    }
}

// ---------------------------------------------------------------------------
// EM steps
// ---------------------------------------------------------------------------

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Fill `resp` (row-major n x k) and return the total log-likelihood.
fn e_step(features: &Matrix, components: &[GaussianComponent], resp: &mut [f64]) -> f64 {
    let k = components.len();
    let mut joint = vec![0.0; k];
    let mut total = 0.0;
    for (i, x) in features.row_iter().enumerate() {
        for (j, c) in components.iter().enumerate() {
            joint[j] = c.weight.ln() + c.log_pdf(x);
        }
        let lse = log_sum_exp(&joint);
        for (r, l) in resp[i * k..(i + 1) * k].iter_mut().zip(&joint) {
            *r = (l - lse).exp();
        }
        total += lse;
    }
    total
}

fn m_step(
    features: &Matrix,
    resp: &[f64],
    k: usize,
    regularization: f64,
) -> Result<Vec<GaussianComponent>, FitError> {
    let n = features.rows();
    let d = features.cols();
    let mut components = Vec::with_capacity(k);
    for j in 0..k {
        let weight_of = |i: usize| resp[i * k + j];
        let nk: f64 = (0..n).map(weight_of).sum();
        if !(nk > f64::EPSILON * n as f64) {
            return Err(FitError::EmptyComponent {
                component: j,
                weight: nk / n as f64,
            });
        }

        let mut mean = vec![0.0; d];
        for (i, x) in features.row_iter().enumerate() {
            let w = weight_of(i);
            for (m, v) in mean.iter_mut().zip(x) {
                *m += w * v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= nk);

        let mut cov = scatter(features, &mean, weight_of);
        cov.scale(1.0 / nk);
        cov.add_diagonal(regularization);

        let component = GaussianComponent::new(nk / n as f64, mean, cov)
            .map_err(|_| FitError::SingularCovariance { component: j })?;
        components.push(component);
    }
    Ok(components)
}

/// Weighted scatter matrix `sum_i w_i (x_i - mean)(x_i - mean)^T`.
fn scatter(features: &Matrix, mean: &[f64], weight_of: impl Fn(usize) -> f64) -> Matrix {
    let d = mean.len();
    let mut s = Matrix::new(d, d);
    let mut diff = vec![0.0; d];
    for (i, x) in features.row_iter().enumerate() {
        let w = weight_of(i);
        if w == 0.0 {
            continue;
        }
        for (dv, (v, m)) in diff.iter_mut().zip(x.iter().zip(mean)) {
            *dv = v - m;
        }
        for a in 0..d {
            for b in 0..=a {
                let v = s.get(a, b) + w * diff[a] * diff[b];
                s.set(a, b, v);
            }
        }
    }
    for a in 0..d {
        for b in 0..a {
            s.set(b, a, s.get(a, b));
        }
    }
    s
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(x: &[f64], centers: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (j, c) in centers.iter().enumerate() {
        let d = sq_dist(x, c);
        if d < best_d {
            best_d = d;
            best = j;
        }
    }
    best
}

/// k-means++ seeding plus Lloyd refinement. Returns the cluster of each row.
fn kmeans(features: &Matrix, k: usize, iterations: usize, rng: &mut StdRng) -> Vec<usize> {
    let n = features.rows();
    let d = features.cols();

    let mut centers: Vec<Vec<f64>> = Vec::with_capacity(k);
    centers.push(features.row(rng.gen_range(0..n)).to_vec());
    let mut dist = vec![f64::INFINITY; n];
    while centers.len() < k {
        let last = &centers[centers.len() - 1];
        for (i, x) in features.row_iter().enumerate() {
            dist[i] = dist[i].min(sq_dist(x, last));
        }
        let total: f64 = dist.iter().sum();
        let pick = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut pick = n - 1;
            for (i, &di) in dist.iter().enumerate() {
                if target < di {
                    pick = i;
                    break;
                }
                target -= di;
            }
            pick
        } else {
            rng.gen_range(0..n)
        };
        centers.push(features.row(pick).to_vec());
    }

    let mut assignments = vec![0usize; n];
    for _ in 0..iterations.max(1) {
        let mut changed = false;
        for (i, x) in features.row_iter().enumerate() {
            let j = nearest(x, &centers);
            if j != assignments[i] {
                assignments[i] = j;
                changed = true;
            }
        }

        let mut sums = vec![vec![0.0; d]; k];
        let mut counts = vec![0usize; k];
        for (x, &j) in features.row_iter().zip(&assignments) {
            counts[j] += 1;
            for (s, v) in sums[j].iter_mut().zip(x) {
                *s += v;
            }
        }
        for j in 0..k {
            // Empty clusters keep their previous center.
            if counts[j] > 0 {
                for (c, s) in centers[j].iter_mut().zip(&sums[j]) {
                    *c = s / counts[j] as f64;
                }
            }
        }

        if !changed {
            break;
        }
    }
    assignments
}

/// Components from a hard assignment. Clusters too small to estimate a
/// covariance borrow the global one.
fn initial_components(
    features: &Matrix,
    assignments: &[usize],
    k: usize,
    regularization: f64,
) -> Result<Vec<GaussianComponent>, FitError> {
    let n = features.rows();
    let d = features.cols();
    let global_mean = features.column_means();
    let mut global_cov = scatter(features, &global_mean, |_| 1.0);
    global_cov.scale(1.0 / n as f64);

    let counts: Vec<usize> = (0..k)
        .map(|j| assignments.iter().filter(|&&a| a == j).count())
        .collect();
    let weight_total: f64 = counts.iter().map(|&c| (c as f64).max(1.0)).sum();

    let mut components = Vec::with_capacity(k);
    for (j, &count) in counts.iter().enumerate() {
        let member = |i: usize| if assignments[i] == j { 1.0 } else { 0.0 };
        let mean = if count == 0 {
            global_mean.clone()
        } else {
            let mut m = vec![0.0; d];
            for (x, &a) in features.row_iter().zip(assignments) {
                if a != j {
                    continue;
                }
                for (mv, v) in m.iter_mut().zip(x) {
                    *mv += v;
                }
            }
            m.iter_mut().for_each(|v| *v /= count as f64);
            m
        };
        let mut cov = if count > d {
            let mut c = scatter(features, &mean, member);
            c.scale(1.0 / count as f64);
            c
        } else {
            global_cov.clone()
        };
        cov.add_diagonal(regularization);

        let weight = (count as f64).max(1.0) / weight_total;
        let component = GaussianComponent::new(weight, mean, cov)
            .map_err(|_| FitError::SingularCovariance { component: j })?;
        components.push(component);
    }
    Ok(components)
}
