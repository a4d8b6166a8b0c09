//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order. A
//! `schema_migrations` table tracks which versions have been applied.

use mf_core::{Error, Result};
use rusqlite::Connection;

/// V1: media records, their source paths and analysed segments.
const V1_INITIAL: &str = r#"
CREATE TABLE media (
    id            TEXT PRIMARY KEY,
    checksum      TEXT NOT NULL UNIQUE,
    size_bytes    INTEGER NOT NULL,
    container     TEXT NOT NULL,
    duration_secs REAL,
    video_codec   TEXT,
    audio_codec   TEXT,
    width         INTEGER,
    height        INTEGER,
    camera_make   TEXT,
    camera_model  TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

-- Every path the same content was ingested from.
CREATE TABLE media_sources (
    media_id   TEXT NOT NULL REFERENCES media(id) ON DELETE CASCADE,
    file_path  TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    PRIMARY KEY (media_id, file_path)
);

CREATE TABLE segments (
    id          TEXT PRIMARY KEY,
    media_id    TEXT NOT NULL REFERENCES media(id) ON DELETE CASCADE,
    position    INTEGER NOT NULL,
    start_secs  REAL NOT NULL,
    end_secs    REAL NOT NULL,
    description TEXT NOT NULL,
    UNIQUE (media_id, position)
);

CREATE INDEX idx_media_sources_path ON media_sources(file_path);
CREATE INDEX idx_segments_media ON segments(media_id);
"#;

/// V2: analysis summary and full report on the media record.
const V2_ANALYSIS: &str = r#"
ALTER TABLE media ADD COLUMN summary TEXT;
ALTER TABLE media ADD COLUMN analysis TEXT;
"#;

/// All migrations in order.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL), (2, V2_ANALYSIS)];

/// Apply every migration that has not run yet.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }

    #[test]
    fn all_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&conn).unwrap();

        for table in ["media", "media_sources", "segments"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "table {table} missing");
        }
    }

    #[test]
    fn checksum_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let insert = "INSERT INTO media (id, checksum, size_bytes, container, created_at, updated_at)
                      VALUES (?1, 'abc', 1, 'mov', 'now', 'now')";
        conn.execute(insert, ["one"]).unwrap();
        assert!(conn.execute(insert, ["two"]).is_err());
    }
}
