//! # Per-Channel Mixture Model
//!
//! Fits mixtures of increasing order to one channel's features and keeps the
//! last order that was a justified improvement over the previous one:
//!
//! ```text
//!   k = 1 ──fit──► accept (first valid fit)
//!   k = 2 ──fit──► better under criterion? ── yes ──► accept, continue
//!                                          └─ no ───► stop, keep previous
//!   k = 3 ──fit──► FitError ──► record, try next k
//!   ...
//!   k = max ─────► stop
//! ```
//!
//! A failed fit at one order never ends the search; if no order fits at all
//! the channel is reported as unsortable with [`FitError::NoValidOrder`].
//!
//! Classification picks the component with the highest posterior and accepts
//! it only when the point's membership probability (chi-square tail of its
//! squared Mahalanobis distance, `d` degrees of freedom) reaches the
//! acceptance threshold. Everything else is noise.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gmm::{EmConfig, FitError, GaussianMixture};
use crate::linalg::Matrix;
use crate::projection::{Projection, ProjectionParams};
use crate::rt::CancelToken;
use crate::stats::chi_square_sf;
use crate::types::{SortError, SortResult, NOISE_UNIT};

/// Model-order selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderCriterion {
    /// Bayesian information criterion must decrease.
    Bic,
    /// Akaike information criterion must decrease.
    Aic,
    /// Likelihood-ratio test: `2 * delta_logL` against a chi-square with
    /// `delta_params` degrees of freedom must be significant.
    LikelihoodRatio { significance: f64 },
}

impl Default for OrderCriterion {
    fn default() -> Self {
        OrderCriterion::Bic
    }
}

impl OrderCriterion {
    /// Whether `candidate` justifies replacing `current`.
    pub fn prefers(&self, current: &GaussianMixture, candidate: &GaussianMixture) -> bool {
        match *self {
            OrderCriterion::Bic => candidate.bic() < current.bic(),
            OrderCriterion::Aic => candidate.aic() < current.aic(),
            OrderCriterion::LikelihoodRatio { significance } => {
                let statistic = 2.0 * (candidate.log_likelihood() - current.log_likelihood());
                let dof = candidate.num_params() as f64 - current.num_params() as f64;
                statistic > 0.0 && chi_square_sf(statistic, dof) < significance
            }
        }
    }

    /// Score used for reporting; lower is better for the information criteria.
    fn score(&self, mixture: &GaussianMixture) -> f64 {
        match self {
            OrderCriterion::Aic => mixture.aic(),
            _ => mixture.bic(),
        }
    }
}

/// Everything a channel fit needs besides its data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelFitSettings {
    pub projection: ProjectionParams,
    pub max_components: usize,
    pub criterion: OrderCriterion,
    pub acceptance_probability: f64,
    pub em: EmConfig,
}

/// Result of trying one mixture order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTrial {
    pub k: usize,
    pub log_likelihood: Option<f64>,
    pub score: Option<f64>,
    pub accepted: bool,
    pub failure: Option<String>,
}

/// Trained model of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelModel {
    channel: usize,
    projection: Projection,
    mixture: GaussianMixture,
    /// Global units allocated before this channel.
    unit_start: u32,
    acceptance_probability: f64,
    trials: Vec<OrderTrial>,
}

impl ChannelModel {
    /// Fit the projection and select a mixture order for one channel.
    ///
    /// `snippets` holds the channel's training spikes as rows. Returns
    /// [`SortError::Cancelled`] if `cancel` fires between orders.
    pub fn train(
        channel: usize,
        snippets: &Matrix,
        settings: &ChannelFitSettings,
        seed: u64,
        cancel: &CancelToken,
    ) -> SortResult<Self> {
        let projection = Projection::fit(&settings.projection, snippets)?;
        let features = projection.project_all(snippets);

        let mut best: Option<GaussianMixture> = None;
        let mut trials = Vec::with_capacity(settings.max_components);

        for k in 1..=settings.max_components {
            if cancel.is_cancelled() {
                return Err(SortError::Cancelled);
            }
            let candidate =
                match GaussianMixture::fit(&features, k, &settings.em, seed.wrapping_add(k as u64)) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(channel, k, error = %e, "mixture order rejected");
                        trials.push(OrderTrial {
                            k,
                            log_likelihood: None,
                            score: None,
                            accepted: false,
                            failure: Some(e.to_string()),
                        });
                        continue;
                    }
                };

            let improves = best
                .as_ref()
                .map_or(true, |current| settings.criterion.prefers(current, &candidate));
            debug!(
                channel,
                k,
                log_likelihood = candidate.log_likelihood(),
                iterations = candidate.iterations(),
                improves,
                "mixture order fitted"
            );
            trials.push(OrderTrial {
                k,
                log_likelihood: Some(candidate.log_likelihood()),
                score: Some(settings.criterion.score(&candidate)),
                accepted: improves,
                failure: None,
            });
            if !improves {
                break;
            }
            best = Some(candidate);
        }

        let mixture = best.ok_or(FitError::NoValidOrder {
            max_k: settings.max_components,
        })?;

        Ok(Self {
            channel,
            projection,
            mixture,
            unit_start: 0,
            acceptance_probability: settings.acceptance_probability,
            trials,
        })
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Number of units found on this channel.
    pub fn k(&self) -> usize {
        self.mixture.num_components()
    }

    pub fn unit_start(&self) -> u32 {
        self.unit_start
    }

    pub(crate) fn set_unit_start(&mut self, start: u32) {
        self.unit_start = start;
    }

    pub fn acceptance_probability(&self) -> f64 {
        self.acceptance_probability
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn mixture(&self) -> &GaussianMixture {
        &self.mixture
    }

    /// Every order tried during training, in order.
    pub fn trials(&self) -> &[OrderTrial] {
        &self.trials
    }

    /// Features of `snippets` under the training-time projection.
    pub fn features(&self, snippets: &Matrix) -> Matrix {
        self.projection.project_all(snippets)
    }

    /// Most likely component for `x` and its membership probability.
    pub fn membership(&self, x: &[f64]) -> (usize, f64) {
        let (best, _) = self.mixture.predict(x);
        let d2 = self.mixture.components()[best].mahalanobis_sq(x);
        (best, chi_square_sf(d2, self.mixture.dimension() as f64))
    }

    /// Classify each feature row; `None` marks a rejected (noise) row.
    pub fn classify_thresh(&self, features: &Matrix) -> Vec<Option<usize>> {
        features
            .row_iter()
            .map(|x| {
                let (component, probability) = self.membership(x);
                (probability >= self.acceptance_probability).then_some(component)
            })
            .collect()
    }

    /// Project and classify raw snippets.
    pub fn classify_snippets(&self, snippets: &Matrix) -> Vec<Option<usize>> {
        self.classify_thresh(&self.features(snippets))
    }

    /// Global unit label of a classification result.
    pub fn unit_label(&self, class: Option<usize>) -> u32 {
        match class {
            Some(local) => self.unit_start + local as u32 + 1,
            None => NOISE_UNIT,
        }
    }
}
