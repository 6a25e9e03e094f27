use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const DRIVE_THUMBNAIL_BASE: &str = "https://drive.google.com/thumbnail";
const DRIVE_DOWNLOAD_BASE: &str = "https://drive.google.com/uc";
const MAX_SLUG_LEN: usize = 100;

/// A single image as stored in the spreadsheet backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    #[serde(deserialize_with = "cell::text")]
    pub id: String,
    #[serde(deserialize_with = "cell::text")]
    pub title: String,
    #[serde(deserialize_with = "cell::text")]
    pub slug: String,
    #[serde(default, deserialize_with = "cell::opt_text", skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, deserialize_with = "cell::text")]
    pub drive_file_id: String,
    #[serde(default, deserialize_with = "cell::opt_text", skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, deserialize_with = "cell::text")]
    pub created_at: String,
    #[serde(default, deserialize_with = "cell::opt_text", skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,
    #[serde(default, deserialize_with = "cell::opt_text", skip_serializing_if = "Option::is_none")]
    pub source_file_id: Option<String>,
    #[serde(default, deserialize_with = "cell::opt_text", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, deserialize_with = "cell::opt_text", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Sheets hands back cells typed by content, so a title like `2024` arrives as a
/// number. Text columns take any scalar and keep its printed form.
mod cell {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(opt_text(deserializer)?.unwrap_or_default())
    }

    pub fn opt_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            Value::Number(n) => Ok(Some(n.to_string())),
            Value::Bool(b) => Ok(Some(b.to_string())),
            other => Err(D::Error::custom(format!("expected a text cell, found {other}"))),
        }
    }
}

impl ImageRecord {
    /// Preview URL, falling back to the Drive thumbnail template when the sheet cell is blank.
    pub fn thumbnail(&self, size_code: &str) -> String {
        match non_blank(&self.thumbnail_url) {
            Some(url) => url.to_string(),
            None => drive_thumbnail_url(&self.drive_file_id, size_code),
        }
    }

    /// Download URL, falling back to the Drive direct-download template.
    pub fn download(&self) -> String {
        match non_blank(&self.download_url) {
            Some(url) => url.to_string(),
            None => drive_download_url(&self.drive_file_id),
        }
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn drive_thumbnail_url(drive_file_id: &str, size_code: &str) -> String {
    format!("{DRIVE_THUMBNAIL_BASE}?id={drive_file_id}&sz={size_code}")
}

pub fn drive_download_url(drive_file_id: &str) -> String {
    format!("{DRIVE_DOWNLOAD_BASE}?id={drive_file_id}&export=download")
}

/// Orders records newest first. Records with an unreadable `createdAt` go last,
/// and equal timestamps keep the backend's order.
pub fn sort_newest_first(records: &mut [ImageRecord]) {
    records.sort_by(|a, b| b.created_at_utc().cmp(&a.created_at_utc()));
}

/// Derives the routing key for a title.
pub fn generate_slug(title: &str) -> String {
    let cleaned: String = title
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();

    let mut slug = String::with_capacity(cleaned.len());
    let mut pending_dash = false;
    for c in cleaned.chars() {
        if c.is_whitespace() || c == '-' {
            pending_dash = true;
            continue;
        }
        if pending_dash {
            slug.push('-');
            pending_dash = false;
        }
        slug.push(c);
    }
    // A trailing separator survives in the browser version; keep it so slugs match.
    if pending_dash {
        slug.push('-');
    }

    slug.chars().take(MAX_SLUG_LEN).collect()
}

/// Timestamped cache payload, persisted as `{data, timestamp}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub data: T,
    /// Capture time in epoch milliseconds.
    pub timestamp: i64,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, timestamp: i64) -> Self {
        Self { data, timestamp }
    }

    pub fn is_fresh(&self, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms - self.timestamp < ttl_ms
    }
}

/// The `{data, error}` envelope returned to API callers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub drive_file_id: String,
    pub thumbnail_url: String,
}

/// Fields sent to the backend when creating an entry; `id` and `createdAt` are assigned there.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewImage {
    pub title: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub drive_file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

/// An image with its derived URLs resolved, as served by the API.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ImageView {
    #[serde(flatten)]
    pub record: ImageRecord,
    pub thumbnail: String,
    pub download: String,
}

impl ImageView {
    pub fn new(record: ImageRecord, thumbnail_size: &str) -> Self {
        let thumbnail = record.thumbnail(thumbnail_size);
        let download = record.download();
        Self {
            record,
            thumbnail,
            download,
        }
    }
}

#[cfg(test)]
pub(crate) fn record(id: &str, title: &str, slug: &str, drive_file_id: &str, created_at: &str) -> ImageRecord {
    ImageRecord {
        id: id.to_string(),
        title: title.to_string(),
        slug: slug.to_string(),
        thumbnail_url: None,
        drive_file_id: drive_file_id.to_string(),
        download_url: None,
        created_at: created_at.to_string(),
        uploaded_by: None,
        source_file_id: None,
        file_type: None,
        description: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_strips_punctuation_and_collapses_whitespace() {
        assert_eq!(generate_slug("  Hello,   World! "), "hello-world");
        assert_eq!(generate_slug("Cats & Dogs -- 2024"), "cats-dogs-2024");
        assert_eq!(generate_slug("snake_case stays"), "snake_case-stays");
    }

    #[test]
    fn numeric_and_boolean_cells_read_as_text() {
        let rec: ImageRecord = serde_json::from_value(serde_json::json!({
            "id": 7,
            "title": 2024,
            "slug": "404",
            "driveFileId": "d7",
            "createdAt": "2024-03-01T00:00:00Z",
            "description": true,
            "uploadedBy": null
        }))
        .unwrap();

        assert_eq!(rec.id, "7");
        assert_eq!(rec.title, "2024");
        assert_eq!(rec.slug, "404");
        assert_eq!(rec.description.as_deref(), Some("true"));
        assert!(rec.uploaded_by.is_none());
    }

    #[test]
    fn nested_cell_values_are_rejected() {
        let result = serde_json::from_value::<ImageRecord>(serde_json::json!({
            "id": "1", "title": {"text": "Cat"}, "slug": "cat"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn slug_is_truncated_to_100_chars() {
        let title = "a".repeat(150);
        assert_eq!(generate_slug(&title).len(), 100);
    }

    #[test]
    fn blank_urls_fall_back_to_drive_templates() {
        let mut rec = record("1", "Cat", "cat", "d1", "2024-01-01T00:00:00Z");
        rec.download_url = Some("   ".to_string());
        assert_eq!(
            rec.thumbnail("s400"),
            "https://drive.google.com/thumbnail?id=d1&sz=s400"
        );
        assert_eq!(
            rec.download(),
            "https://drive.google.com/uc?id=d1&export=download"
        );

        rec.download_url = Some("https://example.com/cat.png".to_string());
        assert_eq!(rec.download(), "https://example.com/cat.png");
    }

    #[test]
    fn sort_puts_newest_first_and_unparseable_last() {
        let mut records = vec![
            record("1", "Cat", "cat", "d1", "2024-01-01T00:00:00Z"),
            record("3", "Bad", "bad", "d3", "not a date"),
            record("2", "Dog", "dog", "d2", "2024-02-01T00:00:00Z"),
        ];
        sort_newest_first(&mut records);
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1", "3"]);
    }

    #[test]
    fn record_reads_sheet_json_with_empty_cells() {
        let json = r#"{"id":"1","title":"Cat","slug":"cat","thumbnailUrl":"","driveFileId":"d1","downloadUrl":"","createdAt":"2024-01-01T00:00:00.000Z"}"#;
        let rec: ImageRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.thumbnail_url.as_deref(), Some(""));
        assert_eq!(rec.thumbnail("s400"), drive_thumbnail_url("d1", "s400"));
        assert!(rec.created_at_utc().is_some());
    }

    #[test]
    fn cache_entry_freshness_boundary() {
        let entry = CacheEntry::new((), 1_000);
        assert!(entry.is_fresh(1_000 + 599_999, 600_000));
        assert!(!entry.is_fresh(1_000 + 600_000, 600_000));
    }
}
