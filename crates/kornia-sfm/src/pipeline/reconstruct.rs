use std::collections::{HashMap, HashSet};

use crate::cancel::CancelToken;
use crate::config::ConfigSfm;
use crate::epipolar::{EpipolarScore3D, ScoreFundamentalVsHomography};
use crate::error::{LookupError, SfmError};
use crate::geometry::camera::{BundleCamera, BundlePinholeSimplified, PinholeCamera};
use crate::geometry::triangulate::triangulation_angle;
use crate::graph::generate::GeneratePairwiseImageGraph;
use crate::graph::pairwise::{MotionId, PairwiseImageGraph, ViewId};
use crate::graph::working::{SceneWorkingGraph, ViewState};
use crate::lookup::LookUpSimilarImages;
use crate::pipeline::expand::ExpandScene;
use crate::pipeline::initialize::{find_common_features, InlierInfo, ProjectiveInitializeAllCommon};
use crate::pipeline::merge::add_triangulated_features_for_all_edges;
use crate::pipeline::metric::{
    bundle_with_flip_check, elevate_cluster, estimate_metric_upgrade, refine_metric_scene, ClusterIntrinsics,
};
use crate::pipeline::score::{DefaultScoreMotion, ScoreMotion};
use crate::structure::{SceneCamera, SceneObservations, SceneStructureMetric, SceneView};

/// What is known about the intrinsics of the images.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum CameraPrior {
    /// Nothing; every image shares one self-calibrated camera.
    #[default]
    Uncalibrated,
    /// Known pinhole cameras, in pixels with the origin at the top left corner.
    Calibrated {
        /// The cameras.
        cameras: Vec<PinholeCamera>,
        /// Camera of every image id.
        view_to_camera: HashMap<String, usize>,
    },
}

/// A metric reconstruction.
#[derive(Clone, Debug)]
pub struct Reconstruction {
    /// Cameras, placed views and points. Pixels are relative to the image center.
    pub structure: SceneStructureMetric,
    /// Observations of every structure view.
    pub observations: SceneObservations,
    /// The pairwise graph the reconstruction was grown on.
    pub pairwise: PairwiseImageGraph,
    /// Images without a pose in the structure.
    pub removed_views: Vec<String>,
}

/// Views with at least two 3D motions, best summed motion score first.
pub fn rank_seed_views(graph: &PairwiseImageGraph, scorer: &dyn ScoreMotion) -> Vec<ViewId> {
    let mut ranked: Vec<(ViewId, f64)> = graph
        .views
        .iter()
        .enumerate()
        .filter_map(|(v, view)| {
            let edges: Vec<&MotionId> = view.connections.iter().filter(|&&m| graph.motions[m].is_3d).collect();
            if edges.len() < 2 {
                return None;
            }
            Some((v, edges.iter().map(|&&m| scorer.score(&graph.motions[m])).sum::<f64>()))
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().map(|(v, _)| v).collect()
}

/// Connections of `seed` used for initialization and the seed features common to all of them.
///
/// 3D motions are added best first while at least `min_common` features remain
/// common, up to `max_connections`.
pub fn select_seed_connections(
    graph: &PairwiseImageGraph,
    scorer: &dyn ScoreMotion,
    seed: ViewId,
    min_common: usize,
    max_connections: usize,
) -> (Vec<MotionId>, Vec<usize>) {
    let mut candidates: Vec<MotionId> = graph.views[seed]
        .connections
        .iter()
        .copied()
        .filter(|&m| graph.motions[m].is_3d)
        .collect();
    candidates.sort_by(|&a, &b| scorer.score(&graph.motions[b]).total_cmp(&scorer.score(&graph.motions[a])));

    let mut selected: Vec<MotionId> = Vec::new();
    let mut common: Vec<usize> = Vec::new();
    for m in candidates {
        if selected.len() >= max_connections {
            break;
        }
        selected.push(m);
        let next = find_common_features(graph, seed, &selected);
        if next.len() < min_common {
            selected.pop();
            continue;
        }
        common = next;
    }
    (selected, common)
}

/// Mark the initialized views as placed and add a feature for every cluster point.
pub fn seed_working_graph(graph: &mut SceneWorkingGraph, inliers: &InlierInfo, cluster: &SceneStructureMetric) {
    for (i, &v) in inliers.views.iter().enumerate() {
        graph.set_state(v, ViewState::Processed);
        graph.views[v].view_to_world = cluster.views[i].pose.inverse();
    }
    for (k, point) in cluster.points.iter().enumerate() {
        let obs: Vec<(ViewId, usize)> = inliers
            .views
            .iter()
            .zip(&inliers.observations)
            .map(|(&v, o)| (v, o[k]))
            .collect();
        let (v0, o0) = obs[0];
        let angle = obs[1..]
            .iter()
            .enumerate()
            .map(|(i, &(v, o))| {
                let a_to_b = cluster.views[0].pose.inverse().then(&cluster.views[i + 1].pose);
                triangulation_angle(&graph.views[v0].norm[o0], &graph.views[v].norm[o], &a_to_b)
            })
            .fold(0.0, f64::max);
        graph.add_feature(point.coordinate, angle, &obs);
    }
}

/// Metric scene of the placed views of a working graph.
///
/// Features seen by fewer than two placed views are left out. `reference` is
/// fixed during bundle adjustment.
pub fn scene_from_working_graph(
    graph: &SceneWorkingGraph,
    reference: ViewId,
) -> (SceneStructureMetric, SceneObservations) {
    let placed = graph.views_in_state(ViewState::Processed);
    let mut index = vec![None; graph.views.len()];
    for (i, &v) in placed.iter().enumerate() {
        index[v] = Some(i);
    }

    let mut structure = SceneStructureMetric::new();
    structure.cameras = graph
        .cameras
        .iter()
        .map(|&model| SceneCamera {
            known: matches!(model, BundleCamera::Pinhole(_)),
            model,
        })
        .collect();
    for &v in &placed {
        let view = &graph.views[v];
        structure.views.push(SceneView {
            id: view.id.clone(),
            known: v == reference,
            pose: view.view_to_world.inverse(),
            camera: Some(view.camera),
            width: view.shape.width,
            height: view.shape.height,
        });
    }

    let mut observations = SceneObservations::new(placed.len());
    for feature in &graph.features {
        let seen: Vec<(usize, usize)> = feature
            .views
            .iter()
            .zip(&feature.obs_idx)
            .filter_map(|(&v, &o)| index[v].map(|i| (i, o)))
            .collect();
        if seen.len() < 2 {
            continue;
        }
        let id = structure.add_point(feature.world);
        for (i, o) in seen {
            structure.connect_point_to_view(id, i);
            observations.views[i].add(id, graph.views[placed[i]].pixels[o]);
        }
    }
    (structure, observations)
}

/// End-to-end sparse reconstruction from pairwise matched images.
///
/// Builds the pairwise graph, initializes a projective cluster around the best
/// seed, elevates it to metric space, grows it to every reachable view and
/// refines the result.
#[derive(Clone, Debug)]
pub struct SparseReconstruction<S: EpipolarScore3D = ScoreFundamentalVsHomography> {
    /// Configuration.
    pub config: ConfigSfm,
    /// Pairwise graph generation.
    pub generate: GeneratePairwiseImageGraph<S>,
}

impl SparseReconstruction<ScoreFundamentalVsHomography> {
    /// Create a reconstruction with the default two-view scorer.
    pub fn new(config: ConfigSfm) -> Self {
        Self::with_scorer(config, ScoreFundamentalVsHomography::new(config.epipolar))
    }
}

impl<S: EpipolarScore3D> SparseReconstruction<S> {
    /// Create a reconstruction with a custom two-view scorer.
    pub fn with_scorer(config: ConfigSfm, scorer: S) -> Self {
        Self {
            config,
            generate: GeneratePairwiseImageGraph::new(scorer),
        }
    }

    /// Reconstruct every image of `db`.
    pub fn process(
        &mut self,
        db: &dyn LookUpSimilarImages,
        prior: &CameraPrior,
        cancel: &CancelToken,
    ) -> Result<Reconstruction, SfmError> {
        let pairwise = self.generate.process(db, cancel)?;
        self.process_graph(db, pairwise, prior, cancel)
    }

    /// Reconstruct from an already built pairwise graph.
    pub fn process_graph(
        &self,
        db: &dyn LookUpSimilarImages,
        pairwise: PairwiseImageGraph,
        prior: &CameraPrior,
        cancel: &CancelToken,
    ) -> Result<Reconstruction, SfmError> {
        let scorer = DefaultScoreMotion;
        let seeds = rank_seed_views(&pairwise, &scorer);
        if seeds.is_empty() {
            return Err(SfmError::NoSeedView);
        }

        let initializer = ProjectiveInitializeAllCommon::new(self.config.init);
        let mut last_error = SfmError::NoSeedView;
        let mut initialized = None;
        for &seed in &seeds {
            cancel.check()?;
            let (connections, common) = select_seed_connections(
                &pairwise,
                &scorer,
                seed,
                self.config.init.min_common_features,
                self.config.init.max_seed_connections,
            );
            match initializer.projective_scene_n(db, &pairwise, seed, &common, &connections, cancel) {
                Ok(init) => {
                    initialized = Some((seed, init));
                    break;
                }
                Err(SfmError::Cancelled) => return Err(SfmError::Cancelled),
                Err(e) => {
                    log::warn!(target: "kornia_sfm::init", "seed {} failed: {e}", pairwise.views[seed].id);
                    last_error = e;
                }
            }
        }
        let Some((seed, init)) = initialized else {
            return Err(last_error);
        };

        // intrinsics of every view for centered pixels
        let (cameras, assignment, cluster_known) = match prior {
            CameraPrior::Calibrated {
                cameras,
                view_to_camera,
            } => {
                let mut assignment = Vec::with_capacity(pairwise.views.len());
                let mut centered: Vec<Option<PinholeCamera>> = vec![None; cameras.len()];
                for view in &pairwise.views {
                    let c = *view_to_camera
                        .get(&view.id)
                        .filter(|&&c| c < cameras.len())
                        .ok_or_else(|| LookupError::UnknownImage(view.id.clone()))?;
                    let camera = cameras[c].centered(&db.lookup_shape(&view.id)?);
                    centered[c].get_or_insert(camera);
                    assignment.push((c, camera));
                }
                let known: Vec<PinholeCamera> = init.inliers.views.iter().map(|&v| assignment[v].1).collect();
                let cameras = centered
                    .iter()
                    .zip(cameras)
                    .map(|(c, raw)| BundleCamera::Pinhole(c.unwrap_or(*raw)))
                    .collect();
                (cameras, assignment, Some(known))
            }
            CameraPrior::Uncalibrated => (Vec::new(), Vec::new(), None),
        };
        let intrinsics = match &cluster_known {
            Some(known) => ClusterIntrinsics::Known(known),
            None => ClusterIntrinsics::Unknown,
        };

        let upgrade = estimate_metric_upgrade(&init, intrinsics, &self.config.metric)?;
        let (mut cluster, cluster_obs) = elevate_cluster(&init, &upgrade, intrinsics)?;
        bundle_with_flip_check(&mut cluster, &cluster_obs, self.config.metric.converge_sba)?;
        cancel.check()?;

        let (cameras, assignment) = match cluster_known {
            Some(_) => (cameras, assignment),
            None => {
                let model = cluster.cameras[0].model;
                let focal = match model {
                    BundleCamera::Simplified(c) => c.f,
                    BundleCamera::Pinhole(c) => c.mean_focal(),
                };
                log::info!(target: "kornia_sfm::metric", "shared focal length {focal:.1}");
                let simplified = match model {
                    BundleCamera::Simplified(c) => c,
                    BundleCamera::Pinhole(_) => BundlePinholeSimplified::new(focal),
                };
                (
                    vec![BundleCamera::Simplified(simplified)],
                    vec![(0, PinholeCamera::from_focal(focal)); pairwise.views.len()],
                )
            }
        };

        let mut graph = SceneWorkingGraph::new(&pairwise, db, cameras, &assignment)?;
        seed_working_graph(&mut graph, &init.inliers, &cluster);

        let expand = ExpandScene::new(self.config.expand);
        expand.prepare_edges(&mut graph, cancel)?;
        for &v in &init.inliers.views {
            add_triangulated_features_for_all_edges(&mut graph, v, self.config.expand.min_scale_overlap);
        }
        let detached = expand.expand(&mut graph, cancel)?;
        if !detached.is_empty() {
            log::warn!(target: "kornia_sfm::expand", "{} views could not be placed", detached.len());
        }

        let (mut structure, mut observations) = scene_from_working_graph(&graph, seed);
        if structure.views.len() < 2 {
            return Err(SfmError::TooFewViews(structure.views.len()));
        }
        refine_metric_scene(&mut structure, &mut observations, &self.config.metric)?;

        let placed: HashSet<&str> = structure.views.iter().map(|v| v.id.as_str()).collect();
        let removed_views: Vec<String> = graph
            .views
            .iter()
            .filter(|v| !placed.contains(v.id.as_str()))
            .map(|v| v.id.clone())
            .collect();
        log::info!(
            target: "kornia_sfm::metric",
            "reconstructed {} of {} views with {} points",
            structure.views.len(),
            graph.views.len(),
            structure.points.len()
        );
        Ok(Reconstruction {
            structure,
            observations,
            pairwise,
            removed_views,
        })
    }
}
