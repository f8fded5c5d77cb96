//! Read-only access to the scraped podcast catalog.
//!
//! The scraper writes `podcasts.json` as one JSON object keyed by video ID.
//! Records are loosely typed on disk (missing titles, `null` durations,
//! numeric or string message IDs), so everything is normalized into a
//! [`ContentRecord`] at load time. The file is re-read on every call; the
//! scraper rewrites it in place and the backend never holds a stale copy.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

const DEFAULT_UPLOADER: &str = "Unknown";
const DEFAULT_CATEGORY: &str = "General";

/// One podcast episode as the resolution engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentRecord {
    pub id: String,
    pub display_title: String,
    pub uploader: String,
    pub category: String,
    pub duration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub youtube_url: Option<String>,
    /// Message reference understood by the relay. `None` means the episode
    /// was never uploaded to the relay's channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<String>,
}

/// Builds the record stored under `key`. The map key is the address clients
/// use, so it always wins over any `id` field inside the entry. Fields with
/// an unexpected type fall back to their defaults instead of failing the
/// whole file.
fn record_from_entry(key: &str, entry: &Value) -> ContentRecord {
    let text = |field: &str| entry.get(field).and_then(string_field);
    let display_title = text("display_title")
        .or_else(|| text("title"))
        .unwrap_or_default();

    ContentRecord {
        id: key.to_owned(),
        display_title,
        uploader: text("uploader").unwrap_or_else(|| DEFAULT_UPLOADER.to_owned()),
        category: text("category").unwrap_or_else(|| DEFAULT_CATEGORY.to_owned()),
        duration_seconds: entry.get("duration").map(duration_seconds).unwrap_or(0),
        created_at: entry.get("created_at").and_then(value_to_string),
        youtube_url: text("youtube_url"),
        remote_ref: entry.get("telegram_message_id").and_then(value_to_string),
    }
}

fn string_field(value: &Value) -> Option<String> {
    value.as_str().and_then(|s| non_empty(Some(s.to_owned())))
}

/// Seconds from a number or a numeric string. Anything else, including
/// negative and non-finite values, counts as unknown.
fn duration_seconds(value: &Value) -> u64 {
    let seconds = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    seconds
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|value| value as u64)
        .unwrap_or(0)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Accepts both `"42"` and `42`; anything else (objects, `null`, blanks) is
/// treated as absent.
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(Some(s.clone())),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Lookup interface the resolution engine depends on.
pub trait Catalog: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<ContentRecord>>;

    /// Every record, newest first (ties broken by ID).
    fn list(&self) -> Result<Vec<ContentRecord>>;
}

/// Catalog backed by the scraper's flat JSON file.
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, Value>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&self.path)
            .with_context(|| format!("reading catalog {}", self.path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing catalog {}", self.path.display()))
    }
}

impl Catalog for JsonCatalog {
    fn get(&self, id: &str) -> Result<Option<ContentRecord>> {
        let mut all = self.load()?;
        Ok(all.remove(id).map(|entry| record_from_entry(id, &entry)))
    }

    fn list(&self) -> Result<Vec<ContentRecord>> {
        let mut records: Vec<ContentRecord> = self
            .load()?
            .into_iter()
            .map(|(key, entry)| record_from_entry(&key, &entry))
            .collect();
        // RFC 3339 timestamps sort lexically; records without one go last.
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }
}
