//! Media record operations.
//!
//! [`upsert_media`] is the only write path used by the pipeline. It is
//! idempotent on checksum: the first insert creates the record, later ones
//! with the same checksum link their path to the existing record and fill in
//! analysis fields that were still empty.

use chrono::Utc;
use mf_core::{Error, MediaId, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::models::{Media, MediaSource};

pub const MEDIA_COLS: &str = "id, checksum, size_bytes, container, duration_secs,
    video_codec, audio_codec, width, height, camera_make, camera_model,
    summary, analysis, created_at, updated_at";

/// Fields written by an ingest.
#[derive(Debug, Clone, Default)]
pub struct NewMedia<'a> {
    pub checksum: &'a str,
    pub file_path: &'a str,
    pub size_bytes: i64,
    pub container: &'a str,
    pub duration_secs: Option<f64>,
    pub video_codec: Option<&'a str>,
    pub audio_codec: Option<&'a str>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub camera_make: Option<&'a str>,
    pub camera_model: Option<&'a str>,
    pub summary: Option<&'a str>,
    pub analysis: Option<&'a serde_json::Value>,
}

/// Result of [`upsert_media`].
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub media: Media,
    /// `true` when this call inserted the record, `false` when it linked to
    /// an existing one.
    pub created: bool,
    /// `true` when the analysis passed to this call is the one now stored.
    /// A linked ingest only fills analysis that was still empty, so its
    /// scenes must not replace the stored ones otherwise.
    pub analysis_written: bool,
}

/// Insert a media record, or link `file_path` to the record that already
/// holds `checksum`.
pub fn upsert_media(conn: &Connection, new: &NewMedia<'_>) -> Result<UpsertOutcome> {
    let now = Utc::now().to_rfc3339();
    let analysis = new
        .analysis
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::database(e.to_string()))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    let inserted = tx
        .execute(
            "INSERT INTO media (id, checksum, size_bytes, container, duration_secs,
                video_codec, audio_codec, width, height, camera_make, camera_model,
                summary, analysis, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?14)
             ON CONFLICT(checksum) DO NOTHING",
            rusqlite::params![
                MediaId::new().to_string(),
                new.checksum,
                new.size_bytes,
                new.container,
                new.duration_secs,
                new.video_codec,
                new.audio_codec,
                new.width,
                new.height,
                new.camera_make,
                new.camera_model,
                new.summary,
                analysis,
                now,
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    let created = inserted == 1;

    let mut analysis_written = created && analysis.is_some();
    if !created {
        let was_empty: bool = tx
            .query_row(
                "SELECT analysis IS NULL FROM media WHERE checksum = ?1",
                [new.checksum],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;
        analysis_written = was_empty && analysis.is_some();

        tx.execute(
            "UPDATE media SET
                summary = COALESCE(summary, ?2),
                analysis = COALESCE(analysis, ?3),
                updated_at = ?4
             WHERE checksum = ?1",
            rusqlite::params![new.checksum, new.summary, analysis, now],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    }

    let q = format!("SELECT {MEDIA_COLS} FROM media WHERE checksum = ?1");
    let media = tx
        .query_row(&q, [new.checksum], Media::from_row)
        .map_err(|e| Error::database(e.to_string()))?;

    tx.execute(
        "INSERT INTO media_sources (media_id, file_path, first_seen)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(media_id, file_path) DO NOTHING",
        rusqlite::params![media.id.to_string(), new.file_path, now],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    tx.commit().map_err(|e| Error::database(e.to_string()))?;

    Ok(UpsertOutcome {
        media,
        created,
        analysis_written,
    })
}

/// Get a media record by ID.
pub fn get_media(conn: &Connection, id: MediaId) -> Result<Option<Media>> {
    let q = format!("SELECT {MEDIA_COLS} FROM media WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], Media::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Get the media record holding `checksum`, if any.
pub fn get_media_by_checksum(conn: &Connection, checksum: &str) -> Result<Option<Media>> {
    let q = format!("SELECT {MEDIA_COLS} FROM media WHERE checksum = ?1");
    conn.query_row(&q, [checksum], Media::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Paths linked to a media record, oldest first.
pub fn list_sources(conn: &Connection, media_id: MediaId) -> Result<Vec<MediaSource>> {
    let mut stmt = conn
        .prepare(
            "SELECT media_id, file_path, first_seen FROM media_sources
             WHERE media_id = ?1 ORDER BY first_seen ASC, file_path ASC",
        )
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([media_id.to_string()], MediaSource::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Count media records.
pub fn count_media(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM media", [], |row| row.get(0))
        .map_err(|e| Error::database(e.to_string()))
}
