//! Inlier-robust 1-D linear regression for scale recovery.

use rand::rngs::SmallRng;
use rand::seq::index;

use crate::config::ScaleRansacConfig;

/// Result of a successful robust fit.
#[derive(Debug, Clone)]
pub struct RegressionFit {
    pub coef: f64,
    pub inliers: Vec<bool>,
    pub inlier_count: usize,
}

/// RANSAC around ordinary least squares through the origin (`y ≈ c·x`).
#[derive(Debug, Clone)]
pub struct RansacRegressor {
    min_samples: usize,
    max_trials: usize,
    stop_prob: f64,
    residual_threshold: f64,
}

impl RansacRegressor {
    pub fn new(cfg: &ScaleRansacConfig) -> Self {
        Self {
            min_samples: cfg.min_samples.max(1),
            max_trials: cfg.max_trials.max(1),
            stop_prob: cfg.stop_prob,
            residual_threshold: cfg.thre,
        }
    }

    /// Fit `y ≈ c·x`; `None` when no consensus model exists.
    pub fn fit(&self, x: &[f64], y: &[f64], rng: &mut SmallRng) -> Option<RegressionFit> {
        let n = x.len();
        if n < self.min_samples || n != y.len() {
            return None;
        }

        let mut best: Option<RegressionFit> = None;
        let mut budget = self.max_trials;
        let mut trial = 0;
        while trial < budget {
            trial += 1;
            let sample = index::sample(rng, n, self.min_samples);
            let coef = match ols_through_origin(sample.iter().map(|i| (x[i], y[i]))) {
                Some(c) => c,
                None => continue,
            };
            let (count, inliers) = self.score(coef, x, y);
            if count > best.as_ref().map_or(0, |b| b.inlier_count) {
                let ratio = count as f64 / n as f64;
                let miss = 1.0 - ratio.powi(self.min_samples as i32);
                best = Some(RegressionFit {
                    coef,
                    inliers,
                    inlier_count: count,
                });
                if miss <= f64::EPSILON {
                    break;
                }
                let needed = ((1.0 - self.stop_prob).ln() / miss.ln()).ceil() as usize;
                budget = budget.min(needed.max(trial));
            }
        }

        let best = best?;
        if best.inlier_count < self.min_samples {
            return None;
        }
        // Re-fit over the consensus set.
        let coef = ols_through_origin(
            best.inliers
                .iter()
                .enumerate()
                .filter(|(_, m)| **m)
                .map(|(i, _)| (x[i], y[i])),
        )?;
        let (count, inliers) = self.score(coef, x, y);
        Some(RegressionFit {
            coef,
            inliers,
            inlier_count: count,
        })
    }

    fn score(&self, coef: f64, x: &[f64], y: &[f64]) -> (usize, Vec<bool>) {
        let mut mask = Vec::with_capacity(x.len());
        let mut count = 0;
        for (&xi, &yi) in x.iter().zip(y.iter()) {
            let inlier = (yi - coef * xi).abs() <= self.residual_threshold;
            mask.push(inlier);
            count += inlier as usize;
        }
        (count, mask)
    }
}

fn ols_through_origin(pairs: impl Iterator<Item = (f64, f64)>) -> Option<f64> {
    let mut xx = 0.0;
    let mut xy = 0.0;
    for (x, y) in pairs {
        xx += x * x;
        xy += x * y;
    }
    if xx <= f64::EPSILON {
        return None;
    }
    let coef = xy / xx;
    coef.is_finite().then_some(coef)
}
