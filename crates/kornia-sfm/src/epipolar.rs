use nalgebra::Matrix3;

use crate::config::ConfigEpipolarScore;
use crate::geometry::fundamental::FundamentalEstimator;
use crate::geometry::homography::HomographyEstimator;
use crate::geometry::ransac::ransac;
use crate::geometry::AssociatedPair;

/// Fundamental matrix and inliers of a scored pair of views.
#[derive(Clone, Debug, PartialEq)]
pub struct EpipolarFit {
    /// Fundamental matrix with `x2ᵀ F x1 = 0`.
    pub fundamental: Matrix3<f64>,
    /// Indices of the correspondences consistent with `fundamental`.
    pub inliers: Vec<usize>,
    /// Number of fundamental matrix inliers.
    pub count_f: usize,
    /// Number of homography inliers.
    pub count_h: usize,
}

/// Decides whether two views observe 3D structure or a degenerate homography.
pub trait EpipolarScore3D {
    /// Score the correspondences. `None` when the views are unrelated.
    fn process(&mut self, pairs: &[AssociatedPair]) -> Option<EpipolarFit>;

    /// Whether the last processed pair has 3D structure.
    fn is_3d(&self) -> bool;

    /// Score of the last processed pair, larger is more 3D.
    fn score(&self) -> f64;
}

/// Compares the support of a fundamental matrix against the support of a homography.
#[derive(Clone, Debug, Default)]
pub struct ScoreFundamentalVsHomography {
    /// Configuration.
    pub config: ConfigEpipolarScore,
    is_3d: bool,
    score: f64,
}

impl ScoreFundamentalVsHomography {
    /// Create a scorer.
    pub fn new(config: ConfigEpipolarScore) -> Self {
        Self {
            config,
            is_3d: false,
            score: 0.0,
        }
    }
}

impl EpipolarScore3D for ScoreFundamentalVsHomography {
    fn process(&mut self, pairs: &[AssociatedPair]) -> Option<EpipolarFit> {
        self.is_3d = false;
        self.score = 0.0;

        let fit_f = ransac(&FundamentalEstimator, pairs, &self.config.ransac_fundamental).ok()?;
        let count_f = fit_f.inliers.len();
        if count_f < self.config.min_inliers {
            return None;
        }
        let count_h = ransac(&HomographyEstimator, pairs, &self.config.ransac_homography)
            .map(|fit| fit.inliers.len())
            .unwrap_or(0);

        self.is_3d = count_f as f64 > self.config.ratio_3d * count_h as f64;
        self.score = count_f as f64 / (count_h as f64 + 1.0);
        Some(EpipolarFit {
            fundamental: fit_f.model,
            inliers: fit_f.inliers,
            count_f,
            count_h,
        })
    }

    fn is_3d(&self) -> bool {
        self.is_3d
    }

    fn score(&self) -> f64 {
        self.score
    }
}
