//! Image handling: size validation before any I/O, durable original
//! ingestion, and best-effort background optimization. A failed optimization
//! never blocks publication; the original ref stands in for the missing
//! variant so the two lists stay index-aligned.

use crate::external::{BlobError, BlobStore};
use crate::lifecycle::LifecycleError;
use crate::models::ImageFile;
use image::ImageFormat;
use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hard ceiling per uploaded image unless overridden via `MAX_IMAGE_BYTES`.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Longest edge kept after optimization.
const MAX_EDGE: u32 = 1280;

pub fn max_image_bytes_from_env() -> usize {
    std::env::var("MAX_IMAGE_BYTES")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_IMAGE_BYTES)
}

#[derive(Clone)]
pub struct ImagePipeline {
    blob: Arc<dyn BlobStore>,
    max_bytes: usize,
}

impl ImagePipeline {
    pub fn new(blob: Arc<dyn BlobStore>, max_bytes: usize) -> Self {
        Self { blob, max_bytes }
    }

    pub fn from_env(blob: Arc<dyn BlobStore>) -> Self {
        Self::new(blob, max_image_bytes_from_env())
    }

    /// Checks sizes before a single byte is written. One oversized file
    /// fails the whole batch, and the error names every offender so the
    /// client can fix them all in one round trip.
    pub fn validate_sizes(&self, files: &[ImageFile]) -> Result<(), LifecycleError> {
        let offenders: Vec<&str> = files
            .iter()
            .filter(|file| file.bytes.len() > self.max_bytes)
            .map(|file| file.filename.as_str())
            .collect();
        if offenders.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Validation(format!(
                "images exceed the {} byte limit: {}",
                self.max_bytes,
                offenders.join(", "),
            )))
        }
    }

    /// Stores original bytes durably, returning refs in upload order. This
    /// runs before the listing row exists, so any failure aborts creation.
    pub async fn ingest_originals(
        &self,
        files: &[ImageFile],
    ) -> Result<Vec<String>, LifecycleError> {
        self.validate_sizes(files)?;
        let mut refs = Vec::with_capacity(files.len());
        for file in files {
            let blob_ref = self
                .blob
                .save(&file.bytes)
                .await
                .map_err(|err| LifecycleError::Storage(err.to_string()))?;
            refs.push(blob_ref);
        }
        Ok(refs)
    }

    /// Produces an optimized ref per original, in order. Failures fall back
    /// to the original ref, so the output always aligns with the input.
    pub async fn optimize(&self, originals: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(originals.len());
        for original in originals {
            match self.optimize_one(original).await {
                Ok(optimized) => out.push(optimized),
                Err(err) => {
                    warn!(
                        target = "bazaar.images",
                        blob_ref = %original,
                        error = %err,
                        "optimization failed, serving the original",
                    );
                    out.push(original.clone());
                }
            }
        }
        out
    }

    async fn optimize_one(&self, original: &str) -> Result<String, OptimizeError> {
        let bytes = self.blob.read(original).await?;
        let before = bytes.len();
        let transcoded = tokio::task::spawn_blocking(move || transcode(&bytes))
            .await
            .map_err(|err| OptimizeError::Decode(err.to_string()))??;
        debug!(
            target = "bazaar.images",
            blob_ref = %original,
            before,
            after = transcoded.len(),
            "image optimized",
        );
        Ok(self.blob.save(&transcoded).await?)
    }
}

#[derive(Debug, thiserror::Error)]
enum OptimizeError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Downscale to a bounded edge and re-encode as JPEG.
fn transcode(bytes: &[u8]) -> Result<Vec<u8>, OptimizeError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| OptimizeError::Decode(err.to_string()))?;
    let resized = if decoded.width() > MAX_EDGE || decoded.height() > MAX_EDGE {
        decoded.thumbnail(MAX_EDGE, MAX_EDGE)
    } else {
        decoded
    };
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(resized.to_rgb8())
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|err| OptimizeError::Decode(err.to_string()))?;
    Ok(out.into_inner())
}

/// Content hash of a listing's first image, used to spot duplicates inside
/// one import batch. Advisory only; it never blocks a normal creation.
pub fn first_image_fingerprint(files: &[ImageFile]) -> Option<u64> {
    files.first().map(|file| {
        let mut hasher = DefaultHasher::new();
        file.bytes.hash(&mut hasher);
        hasher.finish()
    })
}

/// Tracks fingerprints seen within a single import batch.
#[derive(Default)]
pub struct BatchDeduper {
    seen: HashSet<u64>,
}

impl BatchDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when this fingerprint already appeared earlier in the batch.
    pub fn seen_before(&mut self, fingerprint: u64) -> bool {
        !self.seen.insert(fingerprint)
    }
}
