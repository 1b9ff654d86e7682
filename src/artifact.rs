//! The result of a successful build.

use std::fmt;

use crate::builder::BUILDER_ID;
use crate::error::QcbakeError;
use crate::provider::{Image, ImageService};

/// A captured image.
///
/// The image outlives the build: it is owned by whoever holds the artifact
/// and removed only through [`ImageArtifact::destroy`].
#[derive(Debug, Clone)]
pub struct ImageArtifact {
    image_id: String,
    images: ImageService,
}

impl ImageArtifact {
    pub fn new(image_id: impl Into<String>, images: ImageService) -> Self {
        Self {
            image_id: image_id.into(),
            images,
        }
    }

    /// Identifier of the builder that produced this artifact.
    pub fn builder_id(&self) -> &'static str {
        BUILDER_ID
    }

    /// The image id.
    pub fn id(&self) -> &str {
        &self.image_id
    }

    /// Zone the image lives in.
    pub fn zone(&self) -> &str {
        self.images.zone()
    }

    /// Current provider view of the image, `None` if it no longer exists.
    pub fn describe(&self) -> Result<Option<Image>, QcbakeError> {
        self.images
            .describe(&self.image_id)
            .map_err(|e| QcbakeError::from_anyhow("describe_image", e))
    }

    /// Deletes the image.
    pub fn destroy(&self) -> Result<(), QcbakeError> {
        tracing::info!("deleting image {} in {}", self.image_id, self.zone());
        self.images
            .delete(&self.image_id)
            .map_err(|e| QcbakeError::from_anyhow("delete_image", e))
    }
}

impl fmt::Display for ImageArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image {} in zone {}", self.image_id, self.zone())
    }
}
