//! The mapper policy: diff algorithm, id derivation and path layout.

use std::io::Cursor;
use std::sync::Arc;

use image::RgbaImage;

use crate::caching::{CacheContents, CacheError};

mod pixel;

pub use pixel::{PixelDiffMapper, PixelDiffMetrics};

/// A decoded reference image, cheap to clone between cache callers.
pub type Image = Arc<RgbaImage>;

/// Policy object customizing the behavior of a
/// [`DiffStore`](crate::diffstore::DiffStore).
///
/// It defines which diff metric is calculated and how image ids and diff ids
/// translate into paths on the local file system and in remote storage. All
/// operations are pure; implementations carry no mutable state and are safe
/// to call concurrently.
pub trait DiffMapper: Send + Sync + 'static {
    /// The diff metric produced by [`diff`](Self::diff) and persisted through
    /// [`encode`](Self::encode) / [`decode`](Self::decode).
    type Metric: Clone + Send + Sync + 'static;

    /// Calculates the difference between two images, returning the metric and
    /// an image visualizing the differing pixels.
    fn diff(&self, left: &RgbaImage, right: &RgbaImage) -> (Self::Metric, RgbaImage);

    /// Takes two image ids and returns a unique diff id.
    ///
    /// `diff_id(a, b) == diff_id(b, a)` holds.
    fn diff_id(&self, left: &str, right: &str) -> String;

    /// Inverse of [`diff_id`](Self::diff_id): returns `(a, b)` or `(b, a)`.
    fn split_diff_id(&self, id: &str) -> CacheContents<(String, String)>;

    /// The file path for the diff image of two images, relative to the diff
    /// directory. Used to store the diff image on disk and serve it over HTTP.
    fn diff_path(&self, left: &str, right: &str) -> String;

    /// The storage paths for an image id: the local path relative to the
    /// image directory, the remote bucket (empty means "any configured
    /// bucket"), and the path within that bucket.
    fn image_paths(&self, id: &str) -> (String, String, String);

    /// Whether the given diff id is in the correct format.
    fn is_valid_diff_id(&self, id: &str) -> bool;

    /// Whether the given image id is in the correct format.
    fn is_valid_image_id(&self, id: &str) -> bool;

    /// Serializes a metric for the persistent metric store.
    fn encode(&self, metric: &Self::Metric) -> CacheContents<Vec<u8>>;

    /// Inverse of [`encode`](Self::encode).
    fn decode(&self, data: &[u8]) -> CacheContents<Self::Metric>;
}

/// Encodes an image as PNG for storage and serving.
pub fn encode_png(image: &RgbaImage) -> CacheContents<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|err| {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to encode png",
            );
            CacheError::InternalError
        })?;
    Ok(buf.into_inner())
}

/// Decodes PNG bytes into an RGBA image.
pub fn decode_png(data: &[u8]) -> CacheContents<RgbaImage> {
    let image = image::load_from_memory_with_format(data, image::ImageFormat::Png)
        .map_err(|err| CacheError::Malformed(err.to_string()))?;
    Ok(image.to_rgba8())
}
