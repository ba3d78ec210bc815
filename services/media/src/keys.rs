use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

/// Object-key layout. Uploads land under a per-user temp prefix and are
/// promoted into a year/month tree once validated; derived artifacts sit
/// next to the original.
pub fn temp_key(user_id: Uuid, upload_id: Uuid) -> String {
    format!("temp/{}/{}", user_id, upload_id)
}

pub fn permanent_key(upload_id: Uuid, created_at: DateTime<Utc>, extension: &str) -> String {
    let digest = format!("{:x}", md5::compute(upload_id.to_string().as_bytes()));
    format!(
        "permanent/{:04}/{:02}/unlinked/{}.{}",
        created_at.year(),
        created_at.month(),
        &digest[..12],
        extension
    )
}

pub fn derived_key(permanent: &str, suffix: &str, extension: &str) -> String {
    match permanent.rsplit_once('.') {
        Some((stem, _)) => format!("{}-{}.{}", stem, suffix, extension),
        None => format!("{}-{}.{}", permanent, suffix, extension),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn permanent_key_buckets_by_year_and_month() {
        let upload_id = Uuid::parse_str("6e8bc430-9c3a-11d9-9669-0800200c9a66").unwrap();
        let created = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap();

        let key = permanent_key(upload_id, created, "jpg");
        assert!(key.starts_with("permanent/2026/03/unlinked/"));
        assert!(key.ends_with(".jpg"));

        // 12 hex chars of the upload-id digest
        let stem = key
            .rsplit_once('/')
            .unwrap()
            .1
            .strip_suffix(".jpg")
            .unwrap();
        assert_eq!(stem.len(), 12);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn permanent_key_is_deterministic_per_upload() {
        let upload_id = Uuid::new_v4();
        let created = Utc::now();
        assert_eq!(
            permanent_key(upload_id, created, "png"),
            permanent_key(upload_id, created, "png")
        );
    }

    #[test]
    fn derived_keys_share_the_stem() {
        let key = derived_key("permanent/2026/03/unlinked/abcdef123456.jpg", "thumb", "jpg");
        assert_eq!(key, "permanent/2026/03/unlinked/abcdef123456-thumb.jpg");
    }
}
