//! C6 data model: `Memory` and the tagged-union `FieldValue` that backs its
//! dynamic `fields` map (§3, §9 redesign note on dynamic extended fields).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Tagged union for the dynamic `fields` map. Indexing decisions (tokenized
/// vs keyword vs numeric range) branch on the tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Num(f64),
    Bool(bool),
    ArrStr(Vec<String>),
    Raw(serde_json::Value),
}

impl FieldValue {
    /// String values longer than 100 chars are tokenized on indexing;
    /// shorter ones are stored as exact keywords (§3).
    pub fn is_long_text(&self) -> bool {
        matches!(self, FieldValue::Str(s) if s.len() > 100)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str_vec(&self) -> Option<&[String]> {
        match self {
            FieldValue::ArrStr(v) => Some(v),
            _ => None,
        }
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: String,
    pub content: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub is_shared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub files_involved: HashSet<String>,
    #[serde(default)]
    pub fields: Fields,
}

impl Memory {
    pub fn new(memory_type: impl Into<String>, content: impl Into<String>, is_shared: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            memory_type: memory_type.into(),
            content: content.into(),
            created: now,
            modified: now,
            last_accessed: now,
            access_count: 0,
            is_shared,
            session_id: None,
            files_involved: HashSet::new(),
            fields: Fields::new(),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.fields.get("archived").and_then(FieldValue::as_bool).unwrap_or(false)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.fields.get("expiresAt").and_then(FieldValue::as_str),
            Some(expires) if DateTime::parse_from_rfc3339(expires).map(|d| d.with_timezone(&Utc) < now).unwrap_or(false)
        )
    }

    pub fn is_working_memory(&self) -> bool {
        self.fields.contains_key("expiresAt")
    }

    /// Synthesized, tokenized field concatenating content, type, filenames
    /// and string-valued extended fields — the `_all` search field (§3).
    pub fn all_text(&self) -> String {
        let mut parts = vec![self.content.clone(), self.memory_type.clone()];
        for f in &self.files_involved {
            if let Some(name) = f.rsplit(['/', '\\']).next() {
                parts.push(name.to_string());
            }
        }
        for v in self.fields.values() {
            if let Some(s) = v.as_str() {
                parts.push(s.to_string());
            }
        }
        parts.join(" ")
    }
}

pub const PENDING_RESOLUTION_TYPE: &str = "PendingResolution";
pub const RESOLUTION_FEEDBACK_TYPE: &str = "ResolutionFeedback";

/// Request shape accepted by `MemoryStore::search` (§4.6).
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub types: HashSet<String>,
    #[serde(default)]
    pub facets: BTreeMap<String, String>,
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub related_to_ids: HashSet<String>,
    #[serde(default)]
    pub include_archived: bool,
    pub max_results: Option<usize>,
    pub order_by: Option<String>,
    #[serde(default)]
    pub order_descending: bool,
    #[serde(default)]
    pub boost_recent: bool,
    #[serde(default)]
    pub boost_frequent: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SearchResult {
    pub memories: Vec<Memory>,
    pub total: usize,
    pub facets: BTreeMap<String, BTreeMap<String, usize>>,
    pub insights: Vec<String>,
    pub warnings: Vec<String>,
}

/// Patch applied by `update` (§4.6): `field_updates` values of `null` delete
/// the field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryUpdate {
    pub field_updates: BTreeMap<String, Option<FieldValue>>,
    pub content: Option<String>,
    #[serde(default)]
    pub add_files: Vec<String>,
    #[serde(default)]
    pub remove_files: Vec<String>,
}
