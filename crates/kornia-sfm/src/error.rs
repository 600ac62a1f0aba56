/// Errors raised by the geometric solvers.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// Not enough correspondences for the solver.
    #[error("Need at least {required} correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences.
        required: usize,
        /// Number of correspondences provided.
        actual: usize,
    },

    /// Paired inputs have different lengths.
    #[error("Mismatched input lengths: {left} != {right}")]
    MismatchedLengths {
        /// Length of the first input.
        left: usize,
        /// Length of the second input.
        right: usize,
    },

    /// The input configuration does not constrain the model.
    #[error("Degenerate configuration: {0}")]
    Degenerate(&'static str),

    /// RANSAC did not find any model consistent with the data.
    #[error("RANSAC failed to find a model with at least {required} inliers")]
    RansacFailure {
        /// Minimum number of inliers required.
        required: usize,
    },
}

/// Errors raised by image and match lookups.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    /// The image id is not known to the database.
    #[error("Unknown image '{0}'")]
    UnknownImage(String),

    /// An image was registered twice.
    #[error("Image '{0}' is already registered")]
    DuplicateImage(String),

    /// A match references a feature index out of range.
    #[error("Match ({src}, {dst}) is out of range for images '{image_a}' and '{image_b}'")]
    InvalidMatch {
        /// First image.
        image_a: String,
        /// Second image.
        image_b: String,
        /// Feature index in the first image.
        src: usize,
        /// Feature index in the second image.
        dst: usize,
    },
}

/// Errors raised by the reconstruction pipeline.
#[derive(thiserror::Error, Debug)]
pub enum SfmError {
    /// The seed view does not share enough features with its connections.
    #[error("Need at least {required} common features, found {actual}")]
    TooFewCommonFeatures {
        /// Minimum number of common features.
        required: usize,
        /// Number of common features found.
        actual: usize,
    },

    /// The seed view has too few connections.
    #[error("Need at least {required} seed connections, found {actual}")]
    TooFewConnections {
        /// Minimum number of connections.
        required: usize,
        /// Number of connections provided.
        actual: usize,
    },

    /// No view has enough 3D connections to start a reconstruction.
    #[error("No view has enough 3D connections to seed the reconstruction")]
    NoSeedView,

    /// No pair of connections scored above zero.
    #[error("Failed to select an initial view triplet")]
    NoTriplet,

    /// Robust trifocal estimation failed.
    #[error("Trifocal tensor estimation failed: {0}")]
    TrifocalFailed(GeometryError),

    /// Projective cameras could not be elevated to a metric scene.
    #[error("Metric elevation failed: {0}")]
    MetricElevation(&'static str),

    /// The pose of a view could not be estimated.
    #[error("Pose estimation failed: {0}")]
    PoseEstimationFailed(String),

    /// Too few views remain in the reconstruction.
    #[error("Reconstruction has only {0} views")]
    TooFewViews(usize),

    /// Bundle adjustment could not make progress.
    #[error("Bundle adjustment failed: {0}")]
    BundleAdjustment(&'static str),

    /// The reconstruction was cancelled by the caller.
    #[error("Reconstruction cancelled")]
    Cancelled,

    /// Geometric solver error.
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// Lookup error.
    #[error(transparent)]
    Lookup(#[from] LookupError),
}
