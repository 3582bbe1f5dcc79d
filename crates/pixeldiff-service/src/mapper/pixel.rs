use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::caching::{CacheContents, CacheError};

use super::DiffMapper;

/// Color used to mark differing pixels in the diff image.
const DIFF_COLOR: Rgba<u8> = Rgba([241, 105, 140, 255]);

/// Length of an image digest: a lowercase hex md5 of the image contents.
const DIGEST_LENGTH: usize = 32;

const DIFF_ID_SEPARATOR: char = '-';

/// The metric produced by the default pixel-by-pixel diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PixelDiffMetrics {
    /// Number of pixels that differ between the two images. Pixels outside
    /// the overlapping region of differently sized images always count.
    pub num_diff_pixels: u64,
    /// `num_diff_pixels` as a percentage of the united area.
    pub percent_diff_pixels: f32,
    /// The maximum difference per RGBA channel over all differing pixels.
    pub max_channel_diffs: [u8; 4],
    /// Whether the two images have different dimensions.
    pub dim_differ: bool,
}

/// The default [`DiffMapper`]: compares images pixel by pixel.
///
/// Image ids are 32-character lowercase hex digests; a diff id is the two
/// digests sorted and joined with a dash, which makes it commutative.
#[derive(Debug, Clone)]
pub struct PixelDiffMapper {
    /// Directory within the remote bucket that holds the images.
    remote_dir: String,
}

impl PixelDiffMapper {
    pub fn new(remote_dir: &str) -> Self {
        Self {
            remote_dir: remote_dir.trim_matches('/').to_owned(),
        }
    }
}

fn is_valid_digest(id: &str) -> bool {
    id.len() == DIGEST_LENGTH
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `"{id[..2]}/{id}.png"`, the two-level fan-out layout used for both images
/// and diff images on disk. Ids too short for a shard prefix land unsharded.
fn sharded_path(id: &str) -> String {
    match id.get(..2) {
        Some(prefix) => format!("{prefix}/{id}.png"),
        None => format!("{id}.png"),
    }
}

impl DiffMapper for PixelDiffMapper {
    type Metric = PixelDiffMetrics;

    fn diff(&self, left: &RgbaImage, right: &RgbaImage) -> (Self::Metric, RgbaImage) {
        let width = left.width().max(right.width());
        let height = left.height().max(right.height());

        let mut diff_image = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
        let mut num_diff_pixels = 0u64;
        let mut max_channel_diffs = [0u8; 4];

        for y in 0..height {
            for x in 0..width {
                let lp = (x < left.width() && y < left.height()).then(|| left.get_pixel(x, y));
                let rp = (x < right.width() && y < right.height()).then(|| right.get_pixel(x, y));
                if let (Some(lp), Some(rp)) = (lp, rp)
                    && lp == rp
                {
                    continue;
                }

                num_diff_pixels += 1;
                let lc = lp.map_or([0u8; 4], |p| p.0);
                let rc = rp.map_or([0u8; 4], |p| p.0);
                for channel in 0..4 {
                    max_channel_diffs[channel] =
                        max_channel_diffs[channel].max(lc[channel].abs_diff(rc[channel]));
                }
                diff_image.put_pixel(x, y, DIFF_COLOR);
            }
        }

        let total = u64::from(width) * u64::from(height);
        let percent_diff_pixels = if total == 0 {
            0.0
        } else {
            num_diff_pixels as f32 / total as f32 * 100.0
        };

        let metrics = PixelDiffMetrics {
            num_diff_pixels,
            percent_diff_pixels,
            max_channel_diffs,
            dim_differ: left.dimensions() != right.dimensions(),
        };
        (metrics, diff_image)
    }

    fn diff_id(&self, left: &str, right: &str) -> String {
        let (first, second) = if left < right {
            (left, right)
        } else {
            (right, left)
        };
        format!("{first}{DIFF_ID_SEPARATOR}{second}")
    }

    fn split_diff_id(&self, id: &str) -> CacheContents<(String, String)> {
        id.split_once(DIFF_ID_SEPARATOR)
            .map(|(left, right)| (left.to_owned(), right.to_owned()))
            .ok_or_else(|| CacheError::InvalidId(id.to_owned()))
    }

    fn diff_path(&self, left: &str, right: &str) -> String {
        sharded_path(&self.diff_id(left, right))
    }

    fn image_paths(&self, id: &str) -> (String, String, String) {
        let local = sharded_path(id);
        let remote = format!("{}/{id}.png", self.remote_dir);
        // The bucket is left to the loader's configuration.
        (local, String::new(), remote)
    }

    fn is_valid_diff_id(&self, id: &str) -> bool {
        match id.split_once(DIFF_ID_SEPARATOR) {
            Some((left, right)) => {
                is_valid_digest(left) && is_valid_digest(right) && left < right
            }
            None => false,
        }
    }

    fn is_valid_image_id(&self, id: &str) -> bool {
        is_valid_digest(id)
    }

    fn encode(&self, metric: &Self::Metric) -> CacheContents<Vec<u8>> {
        serde_json::to_vec(metric).map_err(|_| CacheError::InternalError)
    }

    fn decode(&self, data: &[u8]) -> CacheContents<Self::Metric> {
        serde_json::from_slice(data).map_err(|err| CacheError::Malformed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(seed: u8) -> String {
        format!("{seed:02x}").repeat(DIGEST_LENGTH / 2)
    }

    #[test]
    fn test_diff_id_commutative() {
        let mapper = PixelDiffMapper::new("dm-images-v1");
        let (a, b) = (digest(0xab), digest(0x0c));

        let id = mapper.diff_id(&a, &b);
        assert_eq!(id, mapper.diff_id(&b, &a));
        assert!(mapper.is_valid_diff_id(&id));

        let (left, right) = mapper.split_diff_id(&id).unwrap();
        assert_eq!((left, right), (b, a));
    }

    #[test]
    fn test_id_validation() {
        let mapper = PixelDiffMapper::new("dm-images-v1");

        assert!(mapper.is_valid_image_id(&digest(0x1f)));
        assert!(!mapper.is_valid_image_id("deadbeef"));
        assert!(!mapper.is_valid_image_id(&digest(0x1f).to_uppercase()));
        assert!(!mapper.is_valid_image_id("../../../../etc/passwd"));

        assert!(!mapper.is_valid_diff_id(&digest(0x0a)));
        assert!(!mapper.is_valid_diff_id(&format!("{}-{}", digest(0x0b), "nope")));
        // Only the sorted form is canonical.
        assert!(!mapper.is_valid_diff_id(&format!("{}-{}", digest(0x0b), digest(0x0a))));
    }

    #[test]
    fn test_paths() {
        let mapper = PixelDiffMapper::new("dm-images-v1");
        let id = digest(0xab);

        let (local, bucket, remote) = mapper.image_paths(&id);
        assert_eq!(local, format!("ab/{id}.png"));
        assert_eq!(bucket, "");
        assert_eq!(remote, format!("dm-images-v1/{id}.png"));

        let diff_id = mapper.diff_id(&digest(0x0a), &digest(0x0b));
        assert_eq!(
            mapper.diff_path(&digest(0x0a), &digest(0x0b)),
            format!("0a/{diff_id}.png")
        );

        // Ids shorter than the shard prefix still map to a path.
        let (local, _, _) = mapper.image_paths("a");
        assert_eq!(local, "a.png");
    }

    #[test]
    fn test_pixel_diff() {
        let mapper = PixelDiffMapper::new("dm-images-v1");
        let left = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        let mut right = left.clone();
        right.put_pixel(0, 0, Rgba([10, 120, 30, 255]));
        right.put_pixel(3, 3, Rgba([0, 20, 30, 255]));

        let (metrics, diff_image) = mapper.diff(&left, &right);
        assert_eq!(metrics.num_diff_pixels, 2);
        assert_eq!(metrics.percent_diff_pixels, 12.5);
        assert_eq!(metrics.max_channel_diffs, [10, 100, 0, 0]);
        assert!(!metrics.dim_differ);

        assert_eq!(*diff_image.get_pixel(0, 0), DIFF_COLOR);
        assert_eq!(*diff_image.get_pixel(1, 1), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_pixel_diff_dimension_mismatch() {
        let mapper = PixelDiffMapper::new("dm-images-v1");
        let left = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255]));
        let right = RgbaImage::from_pixel(2, 3, Rgba([1, 2, 3, 255]));

        let (metrics, diff_image) = mapper.diff(&left, &right);
        // The extra row only exists in the right image.
        assert_eq!(metrics.num_diff_pixels, 2);
        assert!(metrics.dim_differ);
        assert_eq!(diff_image.dimensions(), (2, 3));
    }

    #[test]
    fn test_metric_codec() {
        let mapper = PixelDiffMapper::new("dm-images-v1");
        let metrics = PixelDiffMetrics {
            num_diff_pixels: 42,
            percent_diff_pixels: 1.5,
            max_channel_diffs: [0, 12, 255, 1],
            dim_differ: true,
        };

        let encoded = mapper.encode(&metrics).unwrap();
        assert_eq!(mapper.decode(&encoded).unwrap(), metrics);
        assert!(matches!(
            mapper.decode(b"not json"),
            Err(CacheError::Malformed(_))
        ));
    }
}
