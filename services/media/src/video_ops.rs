use std::path::{Path, PathBuf};

use tokio::process::Command;

use wavechat_common::AppError;

use crate::config::ProcessingConfig;

const THUMBNAIL_AT_SECONDS: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
pub struct VideoMetadata {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
}

/// Probes the container with ffprobe. Encoding stays in OS processes so the
/// async runtime only ever waits on them.
pub async fn probe(input: &Path) -> Result<VideoMetadata, AppError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height:format=duration",
            "-of",
            "json",
        ])
        .arg(input)
        .output()
        .await
        .map_err(|e| AppError::External(format!("ffprobe failed to start: {}", e)))?;

    if !output.status.success() {
        return Err(AppError::Validation(format!(
            "ffprobe rejected the file: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| AppError::Internal(format!("Unreadable ffprobe output: {}", e)))?;

    let stream = parsed
        .get("streams")
        .and_then(|s| s.get(0))
        .ok_or_else(|| AppError::Validation("File has no video stream".to_string()))?;

    Ok(VideoMetadata {
        duration_seconds: parsed
            .pointer("/format/duration")
            .and_then(serde_json::Value::as_str)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0.0),
        width: stream.get("width").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32,
        height: stream.get("height").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32,
    })
}

/// Grabs a single frame at the one-second mark, scaled to the thumbnail
/// box.
pub async fn extract_thumbnail(
    input: &Path,
    out_dir: &Path,
    thumbnail_size: u32,
) -> Result<PathBuf, AppError> {
    let output_path = out_dir.join("thumbnail.jpg");

    let output = Command::new("ffmpeg")
        .args(["-y", "-ss", &THUMBNAIL_AT_SECONDS.to_string(), "-i"])
        .arg(input)
        .args([
            "-frames:v",
            "1",
            "-vf",
            &format!(
                "scale='min({size},iw)':'min({size},ih)':force_original_aspect_ratio=increase,crop={size}:{size}",
                size = thumbnail_size
            ),
        ])
        .arg(&output_path)
        .output()
        .await
        .map_err(|e| AppError::External(format!("ffmpeg failed to start: {}", e)))?;

    if !output.status.success() {
        return Err(AppError::Internal(format!(
            "Thumbnail extraction failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(output_path)
}

/// Segments the video into an HLS rendition. Returns the playlist path; the
/// caller uploads the whole output directory.
pub async fn transcode_hls(input: &Path, out_dir: &Path) -> Result<PathBuf, AppError> {
    let playlist = out_dir.join("playlist.m3u8");
    let segment_pattern = out_dir.join("segment_%04d.ts");

    let output = Command::new("ffmpeg")
        .args(["-y", "-i"])
        .arg(input)
        .args([
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-profile:v",
            "main",
            "-c:a",
            "aac",
            "-hls_time",
            "6",
            "-hls_list_size",
            "0",
            "-hls_segment_filename",
        ])
        .arg(&segment_pattern)
        .args(["-f", "hls"])
        .arg(&playlist)
        .output()
        .await
        .map_err(|e| AppError::External(format!("ffmpeg failed to start: {}", e)))?;

    if !output.status.success() {
        return Err(AppError::Internal(format!(
            "HLS transcode failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(playlist)
}

/// HLS is gated twice: globally by config, per file by duration and width
/// thresholds.
pub fn should_transcode_hls(config: &ProcessingConfig, metadata: &VideoMetadata) -> bool {
    config.hls_enabled
        && metadata.duration_seconds >= config.hls_min_duration_seconds
        && metadata.width >= config.hls_min_width
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_processing(hls_enabled: bool) -> ProcessingConfig {
        ProcessingConfig {
            thumbnail_size: 320,
            optimized_dimension: 1600,
            hls_enabled,
            hls_min_duration_seconds: 30.0,
            hls_min_width: 1280,
            worker_concurrency: 1,
            fetch_retry_attempts: 1,
            fetch_retry_delay_millis: 0,
        }
    }

    #[test]
    fn hls_gate_requires_flag_duration_and_width() {
        let long_wide = VideoMetadata { duration_seconds: 120.0, width: 1920, height: 1080 };
        let short = VideoMetadata { duration_seconds: 5.0, width: 1920, height: 1080 };
        let narrow = VideoMetadata { duration_seconds: 120.0, width: 640, height: 360 };

        assert!(should_transcode_hls(&test_processing(true), &long_wide));
        assert!(!should_transcode_hls(&test_processing(false), &long_wide));
        assert!(!should_transcode_hls(&test_processing(true), &short));
        assert!(!should_transcode_hls(&test_processing(true), &narrow));
    }
}
