//! Rust structs mapping to database tables.
//!
//! Each model implements `from_row` for constructing itself from a
//! `rusqlite::Row`.

use mf_core::{MediaId, SegmentId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Parse a UUID-based ID from a text column.
pub(crate) fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(T::from(uuid))
}

/// Parse an optional JSON document from a text column.
fn parse_opt_json(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|v| {
        serde_json::from_str(&v).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// One unique piece of content, keyed by checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub id: MediaId,
    pub checksum: String,
    pub size_bytes: i64,
    pub container: String,
    pub duration_secs: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub summary: Option<String>,
    pub analysis: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl Media {
    /// Build from a row selected as [`MEDIA_COLS`](crate::queries::media::MEDIA_COLS).
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            checksum: row.get(1)?,
            size_bytes: row.get(2)?,
            container: row.get(3)?,
            duration_secs: row.get(4)?,
            video_codec: row.get(5)?,
            audio_codec: row.get(6)?,
            width: row.get(7)?,
            height: row.get(8)?,
            camera_make: row.get(9)?,
            camera_model: row.get(10)?,
            summary: row.get(11)?,
            analysis: parse_opt_json(row, 12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }
}

/// A path the content of a [`Media`] record was ingested from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSource {
    pub media_id: MediaId,
    pub file_path: String,
    pub first_seen: String,
}

impl MediaSource {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            media_id: parse_id(row, 0)?,
            file_path: row.get(1)?,
            first_seen: row.get(2)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// A described time range of a media record (one analysed scene).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub media_id: MediaId,
    pub position: i64,
    pub start_secs: f64,
    pub end_secs: f64,
    pub description: String,
}

impl Segment {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            media_id: parse_id(row, 1)?,
            position: row.get(2)?,
            start_secs: row.get(3)?,
            end_secs: row.get(4)?,
            description: row.get(5)?,
        })
    }
}
