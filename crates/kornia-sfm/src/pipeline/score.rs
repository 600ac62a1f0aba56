use crate::graph::pairwise::{PairwiseImageGraph, PairwiseMotion, ViewId};

/// Scores how well a motion constrains 3D structure. Higher is better.
pub trait ScoreMotion {
    /// Score of one motion.
    fn score(&self, motion: &PairwiseMotion) -> f64;
}

/// Favors motions with many fundamental inliers relative to homography inliers.
///
/// `min(5, count_f / (count_h + 1)) * count_f`
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultScoreMotion;

impl ScoreMotion for DefaultScoreMotion {
    fn score(&self, motion: &PairwiseMotion) -> f64 {
        let count_f = motion.count_f as f64;
        let ratio = count_f / (motion.count_h as f64 + 1.0);
        ratio.min(5.0) * count_f
    }
}

/// Summed score of the three motions joining `seed`, `b` and `c`.
///
/// Zero when any of the three motions is missing.
pub fn score_triple_view(
    graph: &PairwiseImageGraph,
    scorer: &dyn ScoreMotion,
    seed: ViewId,
    b: ViewId,
    c: ViewId,
) -> f64 {
    let motions = [
        graph.find_motion(seed, b),
        graph.find_motion(seed, c),
        graph.find_motion(b, c),
    ];
    let mut total = 0.0;
    for m in motions {
        match m {
            Some(m) => total += scorer.score(&graph.motions[m]),
            None => return 0.0,
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::AssociatedIndex;
    use nalgebra::Matrix3;

    fn motion(src: ViewId, dst: ViewId, count_f: usize, count_h: usize) -> PairwiseMotion {
        PairwiseMotion {
            src,
            dst,
            is_3d: true,
            score_3d: 1.0,
            fundamental: Matrix3::zeros(),
            inliers: vec![AssociatedIndex::new(0, 0)],
            count_f,
            count_h,
        }
    }

    #[test]
    fn test_ratio_is_capped() {
        let scorer = DefaultScoreMotion;
        assert_eq!(scorer.score(&motion(0, 1, 100, 0)), 500.0);
        assert_eq!(scorer.score(&motion(0, 1, 100, 49)), 200.0);
    }

    #[test]
    fn test_triple_needs_all_edges() {
        let mut graph = PairwiseImageGraph::new();
        for id in ["a", "b", "c"] {
            graph.create_node(id, 100);
        }
        graph.connect(motion(0, 1, 100, 49));
        graph.connect(motion(0, 2, 100, 49));
        assert_eq!(score_triple_view(&graph, &DefaultScoreMotion, 0, 1, 2), 0.0);
        graph.connect(motion(2, 1, 100, 49));
        assert_eq!(score_triple_view(&graph, &DefaultScoreMotion, 0, 1, 2), 600.0);
    }
}
