//! Annotation records fetched from the upstream annotation store.
//!
//! Only the fields needed to place an annotation into a counter are kept.
//! Two wire shapes decode into [`Annotation`]: rows returned by the search
//! API and hits returned by the bulk search index.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors decoding an upstream record into an [`Annotation`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid record: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// An annotation as seen by the counter index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub id: String,
    /// Target URI as stored upstream, not yet normalized.
    pub uri: String,
    pub groupid: String,
    /// Account identifier in `acct:<name>@<domain>` form.
    pub userid: String,
    /// True when readable by the whole group rather than only the owner.
    pub is_shared: bool,
    /// Creation timestamp. Ordered by plain string comparison.
    pub created: String,
}

#[derive(Debug, Deserialize)]
struct ApiRow {
    id: String,
    user: String,
    group: String,
    created: String,
    #[serde(default)]
    target: Vec<ApiTarget>,
    #[serde(default)]
    permissions: ApiPermissions,
}

#[derive(Debug, Deserialize)]
struct ApiTarget {
    source: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiPermissions {
    #[serde(default)]
    read: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct IndexHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: IndexSource,
}

#[derive(Debug, Deserialize)]
struct IndexSource {
    uri: String,
    user: String,
    group: String,
    #[serde(default)]
    shared: bool,
    created: String,
}

impl Annotation {
    /// Decode a row from the search API.
    ///
    /// The URI is the first target's `source`; the annotation is shared when
    /// any read permission names a group principal.
    pub fn from_api_row(row: &Value) -> Result<Self, DecodeError> {
        let row: ApiRow = serde_json::from_value(row.clone())?;
        let uri = row
            .target
            .into_iter()
            .next()
            .and_then(|t| t.source)
            .ok_or(DecodeError::MissingField("target[0].source"))?;
        let is_shared = row.permissions.read.iter().any(|p| p.starts_with("group"));

        Ok(Self {
            id: row.id,
            uri,
            groupid: row.group,
            userid: row.user,
            is_shared,
            created: row.created,
        })
    }

    /// Decode a hit from the bulk search index.
    ///
    /// Records the index marks as deleted come back as
    /// [`IndexRecord::Deleted`] carrying their creation time, so callers can
    /// still advance a cursor past them. Tombstones need only `created`.
    pub fn from_index_hit(hit: &Value) -> Result<IndexRecord, DecodeError> {
        let source = &hit["_source"];
        if source["deleted"].as_bool().unwrap_or(false) {
            let created = source["created"]
                .as_str()
                .ok_or(DecodeError::MissingField("_source.created"))?;
            return Ok(IndexRecord::Deleted {
                created: created.to_string(),
            });
        }

        let hit: IndexHit = serde_json::from_value(hit.clone())?;
        Ok(IndexRecord::Live(Self {
            id: hit.id,
            uri: hit.source.uri,
            groupid: hit.source.group,
            userid: hit.source.user,
            is_shared: hit.source.shared,
            created: hit.source.created,
        }))
    }
}

/// A decoded bulk index hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRecord {
    Live(Annotation),
    /// Tombstone left in the index for a deleted annotation.
    Deleted { created: String },
}

impl IndexRecord {
    pub fn created(&self) -> &str {
        match self {
            IndexRecord::Live(ann) => &ann.created,
            IndexRecord::Deleted { created } => created,
        }
    }
}
