use std::collections::HashSet;

use nalgebra::Vector2;

use crate::cancel::CancelToken;
use crate::epipolar::EpipolarScore3D;
use crate::error::{LookupError, SfmError};
use crate::geometry::AssociatedPair;
use crate::graph::pairwise::{PairwiseImageGraph, PairwiseMotion, ViewId};
use crate::lookup::LookUpSimilarImages;

/// Builds a [`PairwiseImageGraph`] by scoring every candidate pair of similar images.
#[derive(Clone, Debug, Default)]
pub struct GeneratePairwiseImageGraph<S: EpipolarScore3D> {
    /// Two-view scorer.
    pub scorer: S,
}

impl<S: EpipolarScore3D> GeneratePairwiseImageGraph<S> {
    /// Create a generator around a scorer.
    pub fn new(scorer: S) -> Self {
        Self { scorer }
    }

    /// Create one view per image and one motion per related pair.
    ///
    /// Pixels are centered on the image before scoring, so fundamental
    /// matrices relate centered coordinates.
    pub fn process(
        &mut self,
        db: &dyn LookUpSimilarImages,
        cancel: &CancelToken,
    ) -> Result<PairwiseImageGraph, SfmError> {
        let mut graph = PairwiseImageGraph::new();
        let ids = db.image_ids();

        let mut pixels: Vec<Vec<Vector2<f64>>> = Vec::with_capacity(ids.len());
        for id in &ids {
            let center = db.lookup_shape(id)?.center();
            let feats = db.lookup_pixel_feats(id)?;
            graph.create_node(id, feats.len());
            pixels.push(feats.iter().map(|p| p - center).collect());
        }

        let mut visited: HashSet<(ViewId, ViewId)> = HashSet::new();
        for (a, id_a) in ids.iter().enumerate() {
            cancel.check()?;
            for id_b in db.find_similar(id_a)? {
                let Some(b) = graph.lookup_view(&id_b) else {
                    log::warn!(target: "kornia_sfm::graph", "similar image '{id_b}' is not in the database");
                    continue;
                };
                if a == b || !visited.insert((a.min(b), a.max(b))) {
                    continue;
                }
                let Some(matches) = db.lookup_matches(id_a, &id_b)? else {
                    continue;
                };
                if let Some(bad) = matches
                    .iter()
                    .find(|m| m.src >= pixels[a].len() || m.dst >= pixels[b].len())
                {
                    return Err(LookupError::InvalidMatch {
                        image_a: id_a.clone(),
                        image_b: id_b,
                        src: bad.src,
                        dst: bad.dst,
                    }
                    .into());
                }

                let pairs: Vec<AssociatedPair> = matches
                    .iter()
                    .map(|m| AssociatedPair::new(pixels[a][m.src], pixels[b][m.dst]))
                    .collect();
                let Some(fit) = self.scorer.process(&pairs) else {
                    log::debug!(target: "kornia_sfm::graph", "'{id_a}' <-> '{id_b}' rejected, {} matches", matches.len());
                    continue;
                };

                let motion = PairwiseMotion {
                    src: a,
                    dst: b,
                    is_3d: self.scorer.is_3d(),
                    score_3d: self.scorer.score(),
                    fundamental: fit.fundamental,
                    inliers: fit.inliers.iter().map(|&i| matches[i]).collect(),
                    count_f: fit.count_f,
                    count_h: fit.count_h,
                };
                log::debug!(
                    target: "kornia_sfm::graph",
                    "'{id_a}' <-> '{id_b}' inliers={} 3d={} score={:.2}",
                    motion.inliers.len(),
                    motion.is_3d,
                    motion.score_3d
                );
                graph.connect(motion);
            }
        }

        log::info!(
            target: "kornia_sfm::graph",
            "pairwise graph: {} views, {} motions",
            graph.views.len(),
            graph.motions.len()
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epipolar::EpipolarFit;
    use crate::lookup::{AssociatedIndex, ImageShape, SimilarImagesDb};
    use nalgebra::Matrix3;

    /// Accepts pairs with an even number of matches and keeps every other one.
    #[derive(Default)]
    struct EvenScorer {
        calls: usize,
    }

    impl EpipolarScore3D for EvenScorer {
        fn process(&mut self, pairs: &[AssociatedPair]) -> Option<EpipolarFit> {
            self.calls += 1;
            if pairs.len() % 2 == 1 {
                return None;
            }
            Some(EpipolarFit {
                fundamental: Matrix3::identity(),
                inliers: (0..pairs.len()).step_by(2).collect(),
                count_f: pairs.len(),
                count_h: 0,
            })
        }

        fn is_3d(&self) -> bool {
            true
        }

        fn score(&self) -> f64 {
            1.0
        }
    }

    #[test]
    fn test_each_pair_scored_once() -> Result<(), SfmError> {
        let mut db = SimilarImagesDb::new();
        let feats: Vec<Vector2<f64>> = (0..6).map(|i| Vector2::new(i as f64, 0.0)).collect();
        for id in ["a", "b", "c"] {
            db.add_image(id, ImageShape::new(10, 10), feats.clone())?;
        }
        let matches = |n: usize| -> Vec<AssociatedIndex> { (0..n).map(|i| AssociatedIndex::new(i, 5 - i)).collect() };
        db.add_matches("a", "b", matches(4))?;
        db.add_matches("b", "c", matches(3))?;

        let mut generator = GeneratePairwiseImageGraph::new(EvenScorer::default());
        let graph = generator.process(&db, &CancelToken::new())?;

        assert_eq!(generator.scorer.calls, 2);
        assert_eq!(graph.views.len(), 3);
        assert_eq!(graph.motions.len(), 1);
        let motion = &graph.motions[0];
        assert_eq!(motion.inliers, vec![AssociatedIndex::new(0, 5), AssociatedIndex::new(2, 3)]);
        assert_eq!(graph.views[0].total_observations, 6);
        assert!(graph.is_consistent());
        Ok(())
    }

    /// Host database whose matches point past the last feature of the second image.
    struct OutOfRangeMatches(SimilarImagesDb);

    impl LookUpSimilarImages for OutOfRangeMatches {
        fn image_ids(&self) -> Vec<String> {
            self.0.image_ids()
        }

        fn find_similar(&self, id: &str) -> Result<Vec<String>, LookupError> {
            self.0.find_similar(id)
        }

        fn lookup_pixel_feats(&self, id: &str) -> Result<Vec<Vector2<f64>>, LookupError> {
            self.0.lookup_pixel_feats(id)
        }

        fn lookup_matches(&self, id_a: &str, id_b: &str) -> Result<Option<Vec<AssociatedIndex>>, LookupError> {
            Ok(self.0.lookup_matches(id_a, id_b)?.map(|mut matches| {
                matches.push(AssociatedIndex::new(0, 99));
                matches
            }))
        }

        fn lookup_shape(&self, id: &str) -> Result<ImageShape, LookupError> {
            self.0.lookup_shape(id)
        }
    }

    #[test]
    fn test_out_of_range_match_is_an_error() -> Result<(), SfmError> {
        let mut db = SimilarImagesDb::new();
        let feats: Vec<Vector2<f64>> = (0..4).map(|i| Vector2::new(i as f64, 1.0)).collect();
        db.add_image("a", ImageShape::new(10, 10), feats.clone())?;
        db.add_image("b", ImageShape::new(10, 10), feats)?;
        db.add_matches("a", "b", (0..4).map(|i| AssociatedIndex::new(i, i)).collect())?;

        let mut generator = GeneratePairwiseImageGraph::new(EvenScorer::default());
        let result = generator.process(&OutOfRangeMatches(db), &CancelToken::new());
        assert!(matches!(
            result,
            Err(SfmError::Lookup(LookupError::InvalidMatch { src: 0, dst: 99, .. }))
        ));
        assert_eq!(generator.scorer.calls, 0);
        Ok(())
    }
}
