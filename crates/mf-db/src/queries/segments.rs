//! Per-scene segment rows.

use mf_core::{Error, MediaId, Result, SegmentId};
use rusqlite::Connection;

use crate::models::Segment;

/// One scene to store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSegment<'a> {
    pub start_secs: f64,
    pub end_secs: f64,
    pub description: &'a str,
}

/// Replace all segments of `media_id` with `segments`, numbered in order.
///
/// Re-ingesting the same media overwrites its scenes instead of appending.
pub fn replace_segments(
    conn: &Connection,
    media_id: MediaId,
    segments: &[NewSegment<'_>],
) -> Result<Vec<Segment>> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    tx.execute(
        "DELETE FROM segments WHERE media_id = ?1",
        [media_id.to_string()],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    let mut stored = Vec::with_capacity(segments.len());
    for (position, seg) in segments.iter().enumerate() {
        let id = SegmentId::new();
        tx.execute(
            "INSERT INTO segments (id, media_id, position, start_secs, end_secs, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id.to_string(),
                media_id.to_string(),
                position as i64,
                seg.start_secs,
                seg.end_secs,
                seg.description,
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        stored.push(Segment {
            id,
            media_id,
            position: position as i64,
            start_secs: seg.start_secs,
            end_secs: seg.end_secs,
            description: seg.description.to_string(),
        });
    }

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(stored)
}

/// Segments of a media record in playback order.
pub fn list_segments(conn: &Connection, media_id: MediaId) -> Result<Vec<Segment>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, media_id, position, start_secs, end_secs, description
             FROM segments WHERE media_id = ?1 ORDER BY position ASC",
        )
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([media_id.to_string()], Segment::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}
