use std::path::Path;

use tokio::io::AsyncReadExt;

use wavechat_common::AppError;

use crate::models::MediaType;

const SNIFF_LEN: usize = 16;

/// Deep validation of a downloaded file: the leading bytes must carry a
/// signature consistent with the attachment's media type. A mismatch means
/// the client lied about the mime and the file is rejected before any
/// processing touches it.
pub async fn validate_file(path: &Path, media_type: MediaType) -> Result<(), AppError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to open file for validation: {}", e)))?;

    let mut head = [0u8; SNIFF_LEN];
    let read = file
        .read(&mut head)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to read file head: {}", e)))?;

    if read < 4 {
        return Err(AppError::Validation("File is too small to identify".to_string()));
    }

    if matches_media_type(&head[..read], media_type) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "File signature does not match declared type {}",
            media_type.as_str()
        )))
    }
}

fn matches_media_type(head: &[u8], media_type: MediaType) -> bool {
    match media_type {
        MediaType::Image => is_image(head),
        MediaType::Video => is_video(head),
        MediaType::Audio => is_audio(head),
        MediaType::Document => is_document(head),
    }
}

fn is_image(head: &[u8]) -> bool {
    head.starts_with(&[0xFF, 0xD8, 0xFF])                        // JPEG
        || head.starts_with(&[0x89, b'P', b'N', b'G'])           // PNG
        || head.starts_with(b"GIF8")                             // GIF
        || (head.starts_with(b"RIFF") && head.len() >= 12 && &head[8..12] == b"WEBP")
}

fn is_video(head: &[u8]) -> bool {
    (head.len() >= 8 && &head[4..8] == b"ftyp")                  // MP4/MOV family
        || head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3])           // Matroska/WebM
}

fn is_audio(head: &[u8]) -> bool {
    head.starts_with(b"ID3")                                     // MP3 with tag
        || (head.len() >= 2 && head[0] == 0xFF && head[1] & 0xE0 == 0xE0) // raw MPEG frame
        || head.starts_with(b"OggS")                             // OGG
        || (head.starts_with(b"RIFF") && head.len() >= 12 && &head[8..12] == b"WAVE")
        || head.starts_with(b"fLaC")
        || (head.len() >= 8 && &head[4..8] == b"ftyp")           // M4A
}

fn is_document(head: &[u8]) -> bool {
    head.starts_with(b"%PDF")
        || head.starts_with(&[0x50, 0x4B, 0x03, 0x04])           // OOXML/ZIP containers
        || head.starts_with(&[0xD0, 0xCF, 0x11, 0xE0])           // legacy Office
        || head.iter().take(8).all(|b| b.is_ascii() && *b != 0)  // plain text
}

/// File extension used for the permanent key, derived from the original
/// name with the declared mime as fallback.
pub fn extension_for(original_name: &str, mime_type: &str) -> String {
    if let Some((_, ext)) = original_name.rsplit_once('.') {
        if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return ext.to_ascii_lowercase();
        }
    }
    mime_guess::get_mime_extensions_str(mime_type)
        .and_then(|exts| exts.first())
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| "bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn write_temp(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("candidate");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn accepts_png_as_image() {
        let (_dir, path) = write_temp(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]).await;
        validate_file(&path, MediaType::Image).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_pdf_declared_as_image() {
        let (_dir, path) = write_temp(b"%PDF-1.7 rest of document").await;
        let err = validate_file(&path, MediaType::Image).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn accepts_mp4_as_video() {
        let (_dir, path) = write_temp(&[0x00, 0x00, 0x00, 0x18, b'f', b't', b'y', b'p', b'm', b'p', b'4', b'2']).await;
        validate_file(&path, MediaType::Video).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_truncated_files() {
        let (_dir, path) = write_temp(&[0xFF]).await;
        let err = validate_file(&path, MediaType::Audio).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }

    #[test]
    fn extension_prefers_filename() {
        assert_eq!(extension_for("holiday.JPEG", "image/jpeg"), "jpeg");
        assert_eq!(extension_for("notes", "application/pdf"), "pdf");
        assert_eq!(extension_for("weird.name.tar", "application/x-tar"), "tar");
    }
}
