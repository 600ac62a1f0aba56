use nalgebra::{Matrix3x4, Vector2, Vector4};

use crate::bundle::BundleAdjustment;
use crate::cancel::CancelToken;
use crate::config::ConfigProjectiveInit;
use crate::error::SfmError;
use crate::geometry::pnp::pose_from_pair_linear6;
use crate::geometry::ransac::ransac;
use crate::geometry::triangulate::triangulate_projective;
use crate::geometry::trifocal::TrifocalEstimator;
use crate::geometry::AssociatedTriple;
use crate::graph::pairwise::{MotionId, PairwiseImageGraph, ViewId};
use crate::lookup::LookUpSimilarImages;
use crate::pipeline::score::{score_triple_view, DefaultScoreMotion, ScoreMotion};
use crate::structure::{SceneObservations, SceneStructureProjective, SceneView};

/// Which observations of which views produced the points of an initialized cluster.
///
/// `observations[i][k]` is the observation in `views[i]` of structure point `k`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InlierInfo {
    /// Views of the cluster, seed first.
    pub views: Vec<ViewId>,
    /// Per view observation index of every point.
    pub observations: Vec<Vec<usize>>,
}

/// A projective reconstruction of the views around a seed.
#[derive(Clone, Debug)]
pub struct ProjectiveInitialization {
    /// Cameras and homogeneous points; the seed camera is `[I | 0]`.
    pub structure: SceneStructureProjective,
    /// Centered pixel observations, one entry per structure view.
    pub observations: SceneObservations,
    /// Provenance of the points.
    pub inliers: InlierInfo,
}

/// Table from the observations of `view` to the matching observations across `motion`.
pub fn create_table_view_a_to_b(
    graph: &PairwiseImageGraph,
    view: ViewId,
    motion: MotionId,
) -> Vec<Option<usize>> {
    let mut table = vec![None; graph.views[view].total_observations];
    let motion = &graph.motions[motion];
    for inlier in &motion.inliers {
        let (a, b) = motion.oriented(view, inlier);
        if let Some(slot) = table.get_mut(a) {
            *slot = Some(b);
        }
    }
    table
}

/// Observations of `seed` matched across every motion in `connections`.
pub fn find_common_features(
    graph: &PairwiseImageGraph,
    seed: ViewId,
    connections: &[MotionId],
) -> Vec<usize> {
    let tables: Vec<Vec<Option<usize>>> = connections
        .iter()
        .map(|&m| create_table_view_a_to_b(graph, seed, m))
        .collect();
    (0..graph.views[seed].total_observations)
        .filter(|&a| tables.iter().all(|t| t[a].is_some()))
        .collect()
}

/// Best pair of `connections` to form a triple with `seed`, as indices into `connections`.
///
/// `None` with fewer than two connections or when no triple is fully connected.
pub fn select_initial_triplet(
    graph: &PairwiseImageGraph,
    scorer: &dyn ScoreMotion,
    seed: ViewId,
    connections: &[MotionId],
) -> Option<(usize, usize)> {
    let mut best = None;
    let mut best_score = 0.0;
    for i in 0..connections.len() {
        let b = graph.motions[connections[i]].other(seed);
        for j in (i + 1)..connections.len() {
            let c = graph.motions[connections[j]].other(seed);
            let score = score_triple_view(graph, scorer, seed, b, c);
            if score > best_score {
                best_score = score;
                best = Some((i, j));
            }
        }
    }
    best
}

fn centered_pixels(db: &dyn LookUpSimilarImages, id: &str) -> Result<Vec<Vector2<f64>>, SfmError> {
    let center = db.lookup_shape(id)?.center();
    Ok(db.lookup_pixel_feats(id)?.iter().map(|p| p - center).collect())
}

/// Initializes a projective scene from a seed and the features it shares with all
/// of its chosen connections.
///
/// A trifocal tensor fitted on the best triple fixes the first three cameras.
/// The remaining connected views are resected linearly from the triangulated points.
#[derive(Clone, Debug, Default)]
pub struct ProjectiveInitializeAllCommon<M: ScoreMotion = DefaultScoreMotion> {
    /// Configuration.
    pub config: ConfigProjectiveInit,
    /// Scores motions when picking the triple.
    pub scorer: M,
}

impl ProjectiveInitializeAllCommon<DefaultScoreMotion> {
    /// Create an initializer with the default motion score.
    pub fn new(config: ConfigProjectiveInit) -> Self {
        Self {
            config,
            scorer: DefaultScoreMotion,
        }
    }
}

impl<M: ScoreMotion> ProjectiveInitializeAllCommon<M> {
    /// Reconstruct `seed` and the views across `seed_connections`.
    ///
    /// Only the observations in `seed_features` of the seed are used; they must be
    /// matched across every connection.
    pub fn projective_scene_n(
        &self,
        db: &dyn LookUpSimilarImages,
        graph: &PairwiseImageGraph,
        seed: ViewId,
        seed_features: &[usize],
        seed_connections: &[MotionId],
        cancel: &CancelToken,
    ) -> Result<ProjectiveInitialization, SfmError> {
        if seed_connections.len() < 2 {
            return Err(SfmError::TooFewConnections {
                required: 2,
                actual: seed_connections.len(),
            });
        }
        if seed_features.len() < self.config.min_common_features {
            return Err(SfmError::TooFewCommonFeatures {
                required: self.config.min_common_features,
                actual: seed_features.len(),
            });
        }
        let (i, j) = select_initial_triplet(graph, &self.scorer, seed, seed_connections)
            .ok_or(SfmError::NoTriplet)?;
        let (m_ab, m_ac) = (seed_connections[i], seed_connections[j]);
        let b = graph.motions[m_ab].other(seed);
        let c = graph.motions[m_ac].other(seed);
        let m_bc = graph.find_motion(b, c).ok_or(SfmError::NoTriplet)?;

        let table_ab = create_table_view_a_to_b(graph, seed, m_ab);
        let table_ac = create_table_view_a_to_b(graph, seed, m_ac);
        let table_bc = create_table_view_a_to_b(graph, b, m_bc);
        let table_ca = create_table_view_a_to_b(graph, c, m_ac);

        // observation indices in (seed, b, c) that round trip through all tables
        let common: Vec<[usize; 3]> = seed_features
            .iter()
            .filter_map(|&a| {
                let ob = table_ab.get(a).copied().flatten()?;
                let oc = table_ac.get(a).copied().flatten()?;
                let consistent = table_bc.get(ob).copied().flatten() == Some(oc)
                    && table_ca.get(oc).copied().flatten() == Some(a);
                consistent.then_some([a, ob, oc])
            })
            .collect();
        if common.len() < self.config.min_common_features {
            return Err(SfmError::TooFewCommonFeatures {
                required: self.config.min_common_features,
                actual: common.len(),
            });
        }

        let seed_pixels = centered_pixels(db, &graph.views[seed].id)?;
        let pixels_b = centered_pixels(db, &graph.views[b].id)?;
        let pixels_c = centered_pixels(db, &graph.views[c].id)?;
        let triples: Vec<AssociatedTriple> = common
            .iter()
            .map(|&[a, ob, oc]| AssociatedTriple::new(seed_pixels[a], pixels_b[ob], pixels_c[oc]))
            .collect();

        let fit = ransac(&TrifocalEstimator, &triples, &self.config.ransac_trifocal)
            .map_err(SfmError::TrifocalFailed)?;
        let cameras = fit.model.cameras();
        log::debug!(
            target: "kornia_sfm::init",
            "seed {} triple ({}, {}): {} of {} trifocal inliers",
            graph.views[seed].id,
            graph.views[b].id,
            graph.views[c].id,
            fit.inliers.len(),
            triples.len()
        );

        let mut points = Vec::with_capacity(fit.inliers.len());
        let mut inlier_obs: Vec<[usize; 3]> = Vec::with_capacity(fit.inliers.len());
        for &k in &fit.inliers {
            let t = &triples[k];
            if let Some(x) = triangulate_projective(&[t.p1, t.p2, t.p3], &cameras) {
                points.push(x);
                inlier_obs.push(common[k]);
            }
        }
        if points.len() < self.config.min_common_features {
            return Err(SfmError::TooFewCommonFeatures {
                required: self.config.min_common_features,
                actual: points.len(),
            });
        }

        let mut inliers = InlierInfo {
            views: vec![seed, b, c],
            observations: (0..3).map(|v| inlier_obs.iter().map(|o| o[v]).collect()).collect(),
        };
        let mut view_cameras: Vec<Matrix3x4<f64>> = cameras.to_vec();
        let mut view_pixels = vec![seed_pixels, pixels_b, pixels_c];

        for &m in seed_connections {
            if m == m_ab || m == m_ac {
                continue;
            }
            cancel.check()?;
            let v = graph.motions[m].other(seed);
            let table = create_table_view_a_to_b(graph, seed, m);
            let pixels = centered_pixels(db, &graph.views[v].id)?;
            let obs: Option<Vec<usize>> = inliers.observations[0]
                .iter()
                .map(|&a| table.get(a).copied().flatten())
                .collect();
            let Some(obs) = obs else {
                log::warn!(target: "kornia_sfm::init", "view {} does not see every seed point", graph.views[v].id);
                continue;
            };
            let observed: Vec<Vector2<f64>> = obs.iter().map(|&o| pixels[o]).collect();
            match pose_from_pair_linear6(&points, &observed) {
                Ok(p) => {
                    inliers.views.push(v);
                    inliers.observations.push(obs);
                    view_cameras.push(p);
                    view_pixels.push(pixels);
                }
                Err(e) => log::warn!(
                    target: "kornia_sfm::init",
                    "skipping view {}: {e}",
                    graph.views[v].id
                ),
            }
        }

        let (structure, observations) = self.build_structure(db, graph, &inliers, &view_cameras, &view_pixels, &points)?;
        let mut initialization = ProjectiveInitialization {
            structure,
            observations,
            inliers,
        };
        if self.config.converge_sba.max_iterations > 0 {
            BundleAdjustment::new(self.config.converge_sba)
                .optimize_projective(&mut initialization.structure, &initialization.observations)?;
        }
        log::info!(
            target: "kornia_sfm::init",
            "projective cluster of {} views and {} points",
            initialization.structure.views.len(),
            initialization.structure.points.len()
        );
        Ok(initialization)
    }

    fn build_structure(
        &self,
        db: &dyn LookUpSimilarImages,
        graph: &PairwiseImageGraph,
        inliers: &InlierInfo,
        cameras: &[Matrix3x4<f64>],
        pixels: &[Vec<Vector2<f64>>],
        points: &[Vector4<f64>],
    ) -> Result<(SceneStructureProjective, SceneObservations), SfmError> {
        let mut structure = SceneStructureProjective::new();
        let mut observations = SceneObservations::new(inliers.views.len());
        for (i, &v) in inliers.views.iter().enumerate() {
            let shape = db.lookup_shape(&graph.views[v].id)?;
            structure.views.push(SceneView {
                id: graph.views[v].id.clone(),
                known: i == 0,
                pose: cameras[i],
                camera: None,
                width: shape.width,
                height: shape.height,
            });
        }
        for (k, x) in points.iter().enumerate() {
            let id = structure.add_point(*x);
            for (i, obs) in inliers.observations.iter().enumerate() {
                structure.connect_point_to_view(id, i);
                observations.views[i].add(id, pixels[i][obs[k]]);
            }
        }
        Ok((structure, observations))
    }
}
