//! Sidecar metadata records
//!
//! Every model file `name.safetensors` has a JSON sidecar `name.json` that
//! caches its content hash and what the catalog knows about it. Records are
//! rebuilt from scratch on every refresh; nothing from a previous record is
//! carried forward into a new one.

use super::hash::ContentHash;
use crate::remote::{Lookup, ModelVersion};
use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Keys that have held the content hash across record versions, in priority order
pub const HASH_KEYS: [&str; 4] = ["sha256", "SHA256", "hash", "computed_hash"];

/// Model-level details copied from the catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsfw: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poi: Option<bool>,
}

/// Persisted sidecar record
///
/// Field order is the serialized order. Unknown keys from older record
/// shapes are kept in `legacy` so their hash can still be recovered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,

    /// Outer `None` when the key is absent, inner `None` for an explicit null
    #[serde(
        rename = "modelId",
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub model_id: Option<Option<u64>>,

    #[serde(
        rename = "modelVersionId",
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub model_version_id: Option<Option<u64>>,

    #[serde(rename = "trainedWords", default, skip_serializing_if = "Option::is_none")]
    pub trained_words: Option<Vec<String>>,

    #[serde(rename = "baseModel", default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,

    #[serde(
        rename = "lastUpdated",
        alias = "last_updated",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<String>,

    #[serde(
        rename = "notFoundOnRemote",
        alias = "civitai_not_found",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub not_found_on_remote: Option<bool>,

    #[serde(flatten)]
    pub legacy: Map<String, Value>,
}

/// Keeps a present `null` apart from a missing key
fn present<'de, D>(deserializer: D) -> Result<Option<Option<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(Some)
}

impl SidecarRecord {
    /// Full record for a model version the catalog returned
    ///
    /// Fields the catalog left out are written as empty values, and missing
    /// ids as `null`, so the record still reads back as complete.
    pub fn found(hash: &ContentHash, version: &ModelVersion, now: DateTime<Utc>) -> Self {
        let model = version
            .model
            .as_ref()
            .map(|m| ModelInfo {
                name: Some(m.name.clone().unwrap_or_default()),
                kind: Some(m.kind.clone().unwrap_or_default()),
                nsfw: Some(m.nsfw.unwrap_or(false)),
                poi: Some(m.poi.unwrap_or(false)),
            })
            .unwrap_or_default();

        Self {
            sha256: Some(hash.to_string()),
            model: Some(model),
            model_id: Some(version.model_id),
            model_version_id: Some(version.id),
            trained_words: Some(version.trained_words.clone()),
            base_model: Some(version.base_model.clone().unwrap_or_default()),
            last_updated: Some(format_timestamp(now)),
            not_found_on_remote: None,
            legacy: Map::new(),
        }
    }

    /// Minimal terminal record for a hash the catalog does not know
    pub fn not_found(hash: &ContentHash, now: DateTime<Utc>) -> Self {
        Self {
            sha256: Some(hash.to_string()),
            last_updated: Some(format_timestamp(now)),
            not_found_on_remote: Some(true),
            ..Default::default()
        }
    }

    /// Record holding only a freshly computed hash
    ///
    /// Has no timestamp, so it is always classified stale.
    pub fn hash_only(hash: &ContentHash) -> Self {
        Self {
            sha256: Some(hash.to_string()),
            ..Default::default()
        }
    }

    /// Build the record to persist for a lookup outcome
    pub fn refreshed(hash: &ContentHash, lookup: &Lookup, now: DateTime<Utc>) -> Self {
        match lookup {
            Lookup::Found(version) => Self::found(hash, version, now),
            Lookup::NotFound => Self::not_found(hash, now),
        }
    }

    fn raw_field(&self, key: &str) -> Option<&str> {
        match key {
            "sha256" => self.sha256.as_deref(),
            other => self.legacy.get(other).and_then(Value::as_str),
        }
    }

    /// First valid hash found under [`HASH_KEYS`]
    pub fn hash(&self) -> Option<ContentHash> {
        HASH_KEYS
            .iter()
            .filter_map(|key| self.raw_field(key))
            .find_map(|value| ContentHash::parse(value).ok())
    }

    pub fn is_not_found(&self) -> bool {
        self.not_found_on_remote == Some(true)
    }

    /// `model`, `modelId` and `modelVersionId` are all present, possibly as null
    pub fn has_required_fields(&self) -> bool {
        self.model.is_some() && self.model_id.is_some() && self.model_version_id.is_some()
    }

    /// Complete metadata, or the terminal not-found answer
    pub fn has_complete_metadata(&self) -> bool {
        self.is_not_found() || self.has_required_fields()
    }

    /// Catalog data that can be used to look up preview images
    pub fn has_remote_metadata(&self) -> bool {
        !self.is_not_found()
            && (self.model.is_some() || self.model_id.is_some() || self.model_version_id.is_some())
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated.as_deref().and_then(parse_timestamp)
    }

    /// Pretty-printed JSON with 2-space indentation and a trailing newline
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        Ok(content)
    }
}

/// Look up the hash under any of the accepted key names
pub fn extract_hash(record: &SidecarRecord) -> Option<ContentHash> {
    record.hash()
}

/// Render a timestamp the way records store it
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
///
/// RFC 3339 values are used as-is. Older records wrote naive ISO-8601
/// timestamps in local time; those are interpreted in the local zone.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
}

// ============================================================================
// Freshness
// ============================================================================

/// Why a record needs a metadata refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    Forced,
    MissingRecord,
    IncompleteMetadata,
    MissingTimestamp,
    UnparsableTimestamp,
    Expired,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forced => write!(f, "forced refresh"),
            Self::MissingRecord => write!(f, "no sidecar"),
            Self::IncompleteMetadata => write!(f, "incomplete metadata"),
            Self::MissingTimestamp => write!(f, "no timestamp"),
            Self::UnparsableTimestamp => write!(f, "unparsable timestamp"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(StaleReason),
}

impl Freshness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Freshness::Stale(_))
    }
}

/// Rules deciding when cached metadata must be fetched again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub max_age: TimeDelta,
    pub force_refresh: bool,
}

impl FreshnessPolicy {
    pub fn new(max_age_days: u32, force_refresh: bool) -> Self {
        Self {
            max_age: TimeDelta::days(i64::from(max_age_days)),
            force_refresh,
        }
    }

    /// Classify a record at time `now`
    ///
    /// A not-found record counts as complete, so it is only re-queried once
    /// it ages past `max_age` or a refresh is forced. A record exactly
    /// `max_age` old is still fresh.
    pub fn classify(&self, record: Option<&SidecarRecord>, now: DateTime<Utc>) -> Freshness {
        if self.force_refresh {
            return Freshness::Stale(StaleReason::Forced);
        }
        let Some(record) = record else {
            return Freshness::Stale(StaleReason::MissingRecord);
        };
        if !record.has_complete_metadata() {
            return Freshness::Stale(StaleReason::IncompleteMetadata);
        }
        let Some(raw) = record.last_updated.as_deref() else {
            return Freshness::Stale(StaleReason::MissingTimestamp);
        };
        let Some(updated) = parse_timestamp(raw) else {
            return Freshness::Stale(StaleReason::UnparsableTimestamp);
        };
        if now - updated > self.max_age {
            Freshness::Stale(StaleReason::Expired)
        } else {
            Freshness::Fresh
        }
    }
}
