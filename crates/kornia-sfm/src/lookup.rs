use std::collections::HashMap;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::error::LookupError;

/// Correspondence between feature `src` of one image and feature `dst` of another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssociatedIndex {
    /// Feature index in the first image.
    pub src: usize,
    /// Feature index in the second image.
    pub dst: usize,
}

impl AssociatedIndex {
    /// Create a new correspondence.
    pub fn new(src: usize, dst: usize) -> Self {
        Self { src, dst }
    }

    /// The same correspondence seen from the other image.
    pub fn swapped(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

/// Image dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl ImageShape {
    /// Create a new shape.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Offset that moves the image center to the origin.
    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(self.width as f64 / 2.0, self.height as f64 / 2.0)
    }
}

/// Source of image features and pairwise matches.
pub trait LookUpSimilarImages {
    /// Ids of every image.
    fn image_ids(&self) -> Vec<String>;

    /// Ids of images which might share features with `id`.
    fn find_similar(&self, id: &str) -> Result<Vec<String>, LookupError>;

    /// Pixel coordinates of every feature detected in `id`.
    fn lookup_pixel_feats(&self, id: &str) -> Result<Vec<Vector2<f64>>, LookupError>;

    /// Matches from `id_a` to `id_b`, or `None` when the images are unrelated.
    fn lookup_matches(
        &self,
        id_a: &str,
        id_b: &str,
    ) -> Result<Option<Vec<AssociatedIndex>>, LookupError>;

    /// Dimensions of `id`.
    fn lookup_shape(&self, id: &str) -> Result<ImageShape, LookupError>;
}

#[derive(Clone, Debug)]
struct ImageRecord {
    id: String,
    shape: ImageShape,
    pixels: Vec<Vector2<f64>>,
    similar: Vec<usize>,
}

/// In-memory [`LookUpSimilarImages`] filled by the host.
///
/// Two images are similar once matches between them have been added.
#[derive(Clone, Debug, Default)]
pub struct SimilarImagesDb {
    images: Vec<ImageRecord>,
    index: HashMap<String, usize>,
    matches: HashMap<(usize, usize), Vec<AssociatedIndex>>,
}

impl SimilarImagesDb {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Whether no image has been added.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Register an image and its features.
    pub fn add_image(
        &mut self,
        id: impl Into<String>,
        shape: ImageShape,
        pixels: Vec<Vector2<f64>>,
    ) -> Result<(), LookupError> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(LookupError::DuplicateImage(id));
        }
        self.index.insert(id.clone(), self.images.len());
        self.images.push(ImageRecord {
            id,
            shape,
            pixels,
            similar: Vec::new(),
        });
        Ok(())
    }

    /// Add the matches between two registered images, marking them as similar.
    pub fn add_matches(
        &mut self,
        id_a: &str,
        id_b: &str,
        matches: Vec<AssociatedIndex>,
    ) -> Result<(), LookupError> {
        let a = self.image_index(id_a)?;
        let b = self.image_index(id_b)?;
        let (len_a, len_b) = (self.images[a].pixels.len(), self.images[b].pixels.len());
        if let Some(bad) = matches.iter().find(|m| m.src >= len_a || m.dst >= len_b) {
            return Err(LookupError::InvalidMatch {
                image_a: id_a.to_string(),
                image_b: id_b.to_string(),
                src: bad.src,
                dst: bad.dst,
            });
        }

        if !self.images[a].similar.contains(&b) {
            self.images[a].similar.push(b);
            self.images[b].similar.push(a);
        }
        self.matches.remove(&(b, a));
        self.matches.insert((a, b), matches);
        Ok(())
    }

    fn image_index(&self, id: &str) -> Result<usize, LookupError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| LookupError::UnknownImage(id.to_string()))
    }
}

impl LookUpSimilarImages for SimilarImagesDb {
    fn image_ids(&self) -> Vec<String> {
        self.images.iter().map(|image| image.id.clone()).collect()
    }

    fn find_similar(&self, id: &str) -> Result<Vec<String>, LookupError> {
        let i = self.image_index(id)?;
        Ok(self.images[i]
            .similar
            .iter()
            .map(|&j| self.images[j].id.clone())
            .collect())
    }

    fn lookup_pixel_feats(&self, id: &str) -> Result<Vec<Vector2<f64>>, LookupError> {
        let i = self.image_index(id)?;
        Ok(self.images[i].pixels.clone())
    }

    fn lookup_matches(
        &self,
        id_a: &str,
        id_b: &str,
    ) -> Result<Option<Vec<AssociatedIndex>>, LookupError> {
        let a = self.image_index(id_a)?;
        let b = self.image_index(id_b)?;
        if let Some(matches) = self.matches.get(&(a, b)) {
            return Ok(Some(matches.clone()));
        }
        Ok(self
            .matches
            .get(&(b, a))
            .map(|matches| matches.iter().map(AssociatedIndex::swapped).collect()))
    }

    fn lookup_shape(&self, id: &str) -> Result<ImageShape, LookupError> {
        let i = self.image_index(id)?;
        Ok(self.images[i].shape)
    }
}
