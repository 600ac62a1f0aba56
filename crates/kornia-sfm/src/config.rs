use serde::{Deserialize, Serialize};

/// Parameters for a RANSAC model search.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigRansac {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold, in pixels.
    pub inlier_threshold: f64,
    /// Optional RNG seed for deterministic runs.
    pub random_seed: Option<u64>,
}

impl Default for ConfigRansac {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            inlier_threshold: 1.0,
            random_seed: Some(0),
        }
    }
}

impl ConfigRansac {
    /// Set the maximum number of iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the inlier threshold in pixels.
    pub fn with_inlier_threshold(mut self, inlier_threshold: f64) -> Self {
        self.inlier_threshold = inlier_threshold;
        self
    }
}

/// Convergence criteria for nonlinear least squares.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigConverge {
    /// Relative decrease of the cost below which the solver stops.
    pub ftol: f64,
    /// Maximum gradient magnitude below which the solver stops.
    pub gtol: f64,
    /// Maximum number of iterations. Zero disables the optimization.
    pub max_iterations: usize,
}

impl Default for ConfigConverge {
    fn default() -> Self {
        Self {
            ftol: 1e-8,
            gtol: 1e-8,
            max_iterations: 50,
        }
    }
}

/// Configuration of the default two-view scorer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigEpipolarScore {
    /// RANSAC over fundamental matrices.
    pub ransac_fundamental: ConfigRansac,
    /// RANSAC over homographies.
    pub ransac_homography: ConfigRansac,
    /// Minimum number of fundamental inliers to accept a pair.
    pub min_inliers: usize,
    /// A pair is 3D when its fundamental inliers exceed this ratio of homography inliers.
    pub ratio_3d: f64,
}

impl Default for ConfigEpipolarScore {
    fn default() -> Self {
        Self {
            ransac_fundamental: ConfigRansac::default(),
            ransac_homography: ConfigRansac::default().with_inlier_threshold(2.0),
            min_inliers: 30,
            ratio_3d: 1.5,
        }
    }
}

/// Configuration of the projective initialization.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigProjectiveInit {
    /// RANSAC over trifocal tensors.
    pub ransac_trifocal: ConfigRansac,
    /// Minimum number of features common to the seed and its connections.
    pub min_common_features: usize,
    /// Maximum number of connections of the seed included in the cluster.
    pub max_seed_connections: usize,
    /// Projective bundle adjustment of the cluster.
    pub converge_sba: ConfigConverge,
}

impl Default for ConfigProjectiveInit {
    fn default() -> Self {
        Self {
            ransac_trifocal: ConfigRansac::default().with_inlier_threshold(2.0),
            min_common_features: 6,
            max_seed_connections: 5,
            converge_sba: ConfigConverge::default(),
        }
    }
}

/// Configuration of the incremental growth.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigExpand {
    /// RANSAC over calibrated poses. The threshold is in pixels.
    pub ransac_pnp: ConfigRansac,
    /// Minimum number of known 3D features required to estimate a pose.
    pub min_pnp_candidates: usize,
    /// Minimum triangulation angle of a new feature, in radians.
    pub triangulate_min_angle: f64,
    /// Median triangulation angle above which an edge is stereo triangulated, in radians.
    pub stereo_min_median_angle: f64,
    /// Maximum reprojection error of a new feature, in pixels.
    pub max_pixel_error: f64,
    /// Minimum number of overlapping points to reconcile the scale of an edge.
    pub min_scale_overlap: usize,
}

impl Default for ConfigExpand {
    fn default() -> Self {
        Self {
            ransac_pnp: ConfigRansac::default().with_inlier_threshold(2.0),
            min_pnp_candidates: 20,
            triangulate_min_angle: std::f64::consts::PI / 20.0,
            stereo_min_median_angle: std::f64::consts::PI / 10.0,
            max_pixel_error: 2.5,
            min_scale_overlap: 20,
        }
    }
}

/// Configuration of the metric elevation and the final refinement.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetric {
    /// Skip self-calibration and use this focal length, in pixels.
    pub manual_focal_length: Option<f64>,
    /// Fraction of observations kept when pruning by error rank.
    pub prune_fraction: f64,
    /// Metric bundle adjustment.
    pub converge_sba: ConfigConverge,
    /// Ratio between the two smallest singular values below which self-calibration fails.
    pub self_calib_singular_threshold: f64,
    /// Views observing fewer points are pruned.
    pub min_view_observations: usize,
    /// Points observed by fewer views are pruned.
    pub min_point_views: usize,
}

impl Default for ConfigMetric {
    fn default() -> Self {
        Self {
            manual_focal_length: None,
            prune_fraction: 0.7,
            converge_sba: ConfigConverge::default(),
            self_calib_singular_threshold: 1e-3,
            min_view_observations: 10,
            min_point_views: 2,
        }
    }
}

/// Configuration of a complete reconstruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSfm {
    /// Two-view scoring used to build the pairwise graph.
    pub epipolar: ConfigEpipolarScore,
    /// Seed cluster initialization.
    pub init: ConfigProjectiveInit,
    /// Incremental growth.
    pub expand: ConfigExpand,
    /// Metric elevation and refinement.
    pub metric: ConfigMetric,
}

impl ConfigSfm {
    /// Preset for images with known intrinsics.
    pub fn calibrated() -> Self {
        Self::default()
    }

    /// Preset for images with unknown intrinsics.
    pub fn uncalibrated() -> Self {
        let mut config = Self::default();
        config.expand.min_pnp_candidates = 100;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(ConfigSfm::calibrated().expand.min_pnp_candidates, 20);
        assert_eq!(ConfigSfm::uncalibrated().expand.min_pnp_candidates, 100);
        assert_eq!(ConfigSfm::default().init.min_common_features, 6);
        assert_eq!(ConfigSfm::default().metric.prune_fraction, 0.7);
    }

    #[test]
    fn test_config_json_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = ConfigSfm::uncalibrated();
        config.metric.manual_focal_length = Some(420.0);
        let json = serde_json::to_string(&config)?;
        let back: ConfigSfm = serde_json::from_str(&json)?;
        assert_eq!(config, back);
        Ok(())
    }
}
