use std::path::{Path, PathBuf};

use image::imageops::FilterType;

use wavechat_common::AppError;

#[derive(Debug)]
pub struct ImageOutputs {
    pub thumbnail: PathBuf,
    /// Present only when the original exceeded the optimized dimension.
    pub optimized: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
}

/// Derives the cover-fit thumbnail and, for large originals, a fit-inside
/// optimized variant. Decoding and resizing are CPU-bound; the worker calls
/// this through `spawn_blocking` so the socket loops never stall.
pub fn process_image(
    input: &Path,
    out_dir: &Path,
    thumbnail_size: u32,
    optimized_dimension: u32,
) -> Result<ImageOutputs, AppError> {
    let img = image::open(input)
        .map_err(|e| AppError::Validation(format!("Undecodable image: {}", e)))?;
    let width = img.width();
    let height = img.height();

    let thumbnail_path = out_dir.join("thumbnail.jpg");
    let thumbnail = img.resize_to_fill(thumbnail_size, thumbnail_size, FilterType::Lanczos3);
    thumbnail
        .to_rgb8()
        .save(&thumbnail_path)
        .map_err(|e| AppError::Internal(format!("Failed to write thumbnail: {}", e)))?;

    let optimized = if width.max(height) > optimized_dimension {
        let optimized_path = out_dir.join("optimized.jpg");
        let resized = img.resize(optimized_dimension, optimized_dimension, FilterType::Lanczos3);
        resized
            .to_rgb8()
            .save(&optimized_path)
            .map_err(|e| AppError::Internal(format!("Failed to write optimized image: {}", e)))?;
        Some(optimized_path)
    } else {
        None
    };

    Ok(ImageOutputs {
        thumbnail: thumbnail_path,
        optimized,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn write_test_image(dir: &Path, width: u32, height: u32) -> PathBuf {
        let path = dir.join("input.png");
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn small_images_get_only_a_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_test_image(dir.path(), 640, 480);

        let outputs = process_image(&input, dir.path(), 320, 1600).unwrap();

        assert!(outputs.thumbnail.exists());
        assert!(outputs.optimized.is_none());
        assert_eq!((outputs.width, outputs.height), (640, 480));
    }

    #[test]
    fn large_images_also_get_an_optimized_variant() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_test_image(dir.path(), 2000, 1200);

        let outputs = process_image(&input, dir.path(), 320, 1600).unwrap();

        let optimized = outputs.optimized.expect("optimized variant");
        let resized = image::open(optimized).unwrap();
        assert!(resized.width() <= 1600 && resized.height() <= 1600);

        let thumb = image::open(outputs.thumbnail).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (320, 320));
    }

    #[test]
    fn garbage_input_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.png");
        std::fs::write(&path, b"not an image at all").unwrap();

        let err = process_image(&path, dir.path(), 320, 1600).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }
}
