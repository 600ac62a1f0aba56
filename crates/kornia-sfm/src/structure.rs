use std::fmt::Debug;

use nalgebra::{Matrix3x4, Vector2, Vector3, Vector4};

use crate::geometry::camera::BundleCamera;
use crate::geometry::se3::Se3;

/// Geometry of a scene: how points and view poses are represented.
pub trait SceneGeometry: Clone + Debug {
    /// A scene point.
    type Point: Clone + Debug + PartialEq;
    /// The pose of a view.
    type Pose: Clone + Debug + PartialEq;
}

/// Projective scene: homogeneous points and 3x4 camera matrices.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projective;

impl SceneGeometry for Projective {
    type Point = Vector4<f64>;
    type Pose = Matrix3x4<f64>;
}

/// Metric scene: Cartesian points and world to view transforms with cameras.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Metric;

impl SceneGeometry for Metric {
    type Point = Vector3<f64>;
    type Pose = Se3;
}

/// Camera shared by views of a metric scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneCamera {
    /// Excluded from optimization when known.
    pub known: bool,
    /// The camera model.
    pub model: BundleCamera,
}

/// A view of a scene.
#[derive(Clone, Debug, PartialEq)]
pub struct SceneView<G: SceneGeometry> {
    /// Image id.
    pub id: String,
    /// Excluded from optimization when known.
    pub known: bool,
    /// World to view pose.
    pub pose: G::Pose,
    /// Index of the camera, metric scenes only.
    pub camera: Option<usize>,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
}

/// A point of a scene and the views observing it.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenePoint<G: SceneGeometry> {
    /// Location.
    pub coordinate: G::Point,
    /// Views observing the point.
    pub views: Vec<usize>,
}

/// Cameras, views and points of a sparse reconstruction.
#[derive(Clone, Debug, PartialEq)]
pub struct SceneStructure<G: SceneGeometry> {
    /// Cameras, metric scenes only.
    pub cameras: Vec<SceneCamera>,
    /// Views.
    pub views: Vec<SceneView<G>>,
    /// Points.
    pub points: Vec<ScenePoint<G>>,
}

/// Metric scene structure.
pub type SceneStructureMetric = SceneStructure<Metric>;

/// Projective scene structure.
pub type SceneStructureProjective = SceneStructure<Projective>;

impl<G: SceneGeometry> Default for SceneStructure<G> {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            views: Vec::new(),
            points: Vec::new(),
        }
    }
}

impl<G: SceneGeometry> SceneStructure<G> {
    /// Create an empty scene.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a point and return its index.
    pub fn add_point(&mut self, coordinate: G::Point) -> usize {
        self.points.push(ScenePoint {
            coordinate,
            views: Vec::new(),
        });
        self.points.len() - 1
    }

    /// Record that `view` observes `point`.
    pub fn connect_point_to_view(&mut self, point: usize, view: usize) {
        let views = &mut self.points[point].views;
        if !views.contains(&view) {
            views.push(view);
        }
    }
}

impl SceneStructure<Metric> {
    /// Project a point into a view, in centered pixels.
    pub fn project(&self, view: usize, point: usize) -> Option<Vector2<f64>> {
        let v = &self.views[view];
        let camera = &self.cameras[v.camera?];
        camera.model.project(&v.pose.transform(&self.points[point].coordinate))
    }

    /// Depth of a point in the frame of a view.
    pub fn depth(&self, view: usize, point: usize) -> f64 {
        self.views[view]
            .pose
            .transform(&self.points[point].coordinate)
            .z
    }
}

impl SceneStructure<Projective> {
    /// Project a point into a view.
    pub fn project(&self, view: usize, point: usize) -> Option<Vector2<f64>> {
        let h = self.views[view].pose * self.points[point].coordinate;
        if h.z.abs() < 1e-12 {
            return None;
        }
        Some(Vector2::new(h.x / h.z, h.y / h.z))
    }
}

/// Observations of one view: parallel arrays of point ids and pixels.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservationView {
    /// Point observed.
    pub points: Vec<usize>,
    /// Pixel of the observation.
    pub pixels: Vec<Vector2<f64>>,
}

impl ObservationView {
    /// Number of observations.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the view has no observation.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Add an observation.
    pub fn add(&mut self, point: usize, pixel: Vector2<f64>) {
        self.points.push(point);
        self.pixels.push(pixel);
    }

    /// Remove the observation at `index`, keeping the order of the others.
    pub fn remove(&mut self, index: usize) {
        self.points.remove(index);
        self.pixels.remove(index);
    }

    /// Index of the observation of `point`.
    pub fn index_of_point(&self, point: usize) -> Option<usize> {
        self.points.iter().position(|&p| p == point)
    }
}

/// Per view observations of a scene.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SceneObservations {
    /// One entry per view.
    pub views: Vec<ObservationView>,
}

impl SceneObservations {
    /// Create observations for `n` views.
    pub fn new(n: usize) -> Self {
        Self {
            views: vec![ObservationView::default(); n],
        }
    }

    /// Total number of observations.
    pub fn total(&self) -> usize {
        self.views.iter().map(ObservationView::len).sum()
    }
}
