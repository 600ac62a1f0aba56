use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ConfigRansac;
use crate::error::GeometryError;

/// A model that can be fit to minimal samples and scored against data.
pub trait RansacEstimator {
    /// A single observation.
    type Datum: Clone;
    /// The estimated model.
    type Model: Clone;

    /// Number of observations in a minimal sample.
    fn sample_size(&self) -> usize;

    /// Fit a model to a sample of at least `sample_size` observations.
    fn fit(&self, sample: &[Self::Datum]) -> Option<Self::Model>;

    /// Squared error of a datum against a model, in the units of the threshold.
    fn error(&self, model: &Self::Model, datum: &Self::Datum) -> f64;
}

/// Result of a RANSAC model fit.
#[derive(Clone, Debug)]
pub struct RansacResult<M> {
    /// Estimated model.
    pub model: M,
    /// Indices of the inliers, in input order.
    pub inliers: Vec<usize>,
    /// Sum of inlier errors (lower is better).
    pub score: f64,
}

fn rng_from(params: &ConfigRansac) -> StdRng {
    match params.random_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => {
            let mut tr = rand::rng();
            StdRng::from_rng(&mut tr)
        }
    }
}

fn classify<E: RansacEstimator>(
    estimator: &E,
    model: &E::Model,
    data: &[E::Datum],
    threshold2: f64,
) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut score = 0.0;
    for (i, datum) in data.iter().enumerate() {
        let e = estimator.error(model, datum);
        if e <= threshold2 {
            inliers.push(i);
            score += e;
        }
    }
    (inliers, score)
}

/// Robustly fit a model with random sample consensus.
///
/// The best model maximizes the inlier count, ties broken by the summed inlier
/// error. It is then refit on all its inliers and the refit is kept when it
/// does not lose inliers.
pub fn ransac<E: RansacEstimator>(
    estimator: &E,
    data: &[E::Datum],
    params: &ConfigRansac,
) -> Result<RansacResult<E::Model>, GeometryError> {
    let k = estimator.sample_size();
    if data.len() < k {
        return Err(GeometryError::InsufficientCorrespondences {
            required: k,
            actual: data.len(),
        });
    }

    let threshold2 = params.inlier_threshold * params.inlier_threshold;
    let mut rng = rng_from(params);
    let mut sample = Vec::with_capacity(k);
    let mut best: Option<RansacResult<E::Model>> = None;

    for _ in 0..params.max_iterations {
        sample.clear();
        for i in rand::seq::index::sample(&mut rng, data.len(), k) {
            sample.push(data[i].clone());
        }
        let Some(model) = estimator.fit(&sample) else {
            continue;
        };

        let (inliers, score) = classify(estimator, &model, data, threshold2);
        let better = match &best {
            None => true,
            Some(b) => {
                inliers.len() > b.inliers.len()
                    || (inliers.len() == b.inliers.len() && score < b.score)
            }
        };
        if better {
            let done = inliers.len() == data.len();
            best = Some(RansacResult {
                model,
                inliers,
                score,
            });
            if done {
                break;
            }
        }
    }

    let best = match best {
        Some(b) if b.inliers.len() >= k => b,
        _ => return Err(GeometryError::RansacFailure { required: k }),
    };

    let inlier_data: Vec<E::Datum> = best.inliers.iter().map(|&i| data[i].clone()).collect();
    if let Some(model) = estimator.fit(&inlier_data) {
        let (inliers, score) = classify(estimator, &model, data, threshold2);
        if inliers.len() >= best.inliers.len() {
            return Ok(RansacResult {
                model,
                inliers,
                score,
            });
        }
    }
    Ok(best)
}
