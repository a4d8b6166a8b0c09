use async_trait::async_trait;
use mf_core::{Error, Result};
use mf_db::queries::media::{self, NewMedia};
use mf_db::queries::segments::{self, NewSegment};
use mf_db::DbPool;

use crate::analysis::AnalysisReport;
use crate::bag::StepBag;
use crate::step::{Step, StepContext, StepOutcome};

/// Upserts the media record (idempotent on checksum) and its scenes. Writes
/// `store.media_id`, `store.linked` and `store.segments` (the number of
/// segments stored for the record).
pub struct StoreStep {
    db: DbPool,
}

impl StoreStep {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

/// Owned copy of the bag fields the record needs, so the write can move to
/// the blocking pool.
struct Record {
    checksum: String,
    file_path: String,
    size_bytes: i64,
    container: String,
    duration_secs: Option<f64>,
    video_codec: Option<String>,
    audio_codec: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    camera_make: Option<String>,
    camera_model: Option<String>,
    report: Option<AnalysisReport>,
    analysis: Option<serde_json::Value>,
}

impl Record {
    fn from_bag(bag: &StepBag<'_>, ctx: &StepContext) -> Result<Self> {
        let required = |key: &str| {
            bag.text(key)
                .map(str::to_string)
                .ok_or_else(|| Error::missing_input(bag.namespace(), key))
        };
        let text = |key: &str| bag.text(key).map(str::to_string);

        let analysis = bag.json("analyze.report").cloned();
        let report = analysis
            .clone()
            .map(AnalysisReport::from_json)
            .transpose()?;

        Ok(Self {
            checksum: required("checksum.sha256")?,
            file_path: ctx.path.display().to_string(),
            size_bytes: bag.integer("checksum.size_bytes").unwrap_or_default(),
            container: required("metadata.container")?,
            duration_secs: bag.float("metadata.duration_secs"),
            video_codec: text("metadata.video_codec"),
            audio_codec: text("metadata.audio_codec"),
            width: bag.integer("metadata.width"),
            height: bag.integer("metadata.height"),
            camera_make: text("metadata.camera_make"),
            camera_model: text("metadata.camera_model"),
            report,
            analysis,
        })
    }
}

#[async_trait]
impl Step for StoreStep {
    async fn run(&self, ctx: &StepContext, bag: &mut StepBag<'_>) -> Result<StepOutcome> {
        let record = Record::from_bag(bag, ctx)?;

        let (outcome, segment_count) = super::with_conn(&self.db, move |conn| {
            let outcome = media::upsert_media(
                conn,
                &NewMedia {
                    checksum: &record.checksum,
                    file_path: &record.file_path,
                    size_bytes: record.size_bytes,
                    container: &record.container,
                    duration_secs: record.duration_secs,
                    video_codec: record.video_codec.as_deref(),
                    audio_codec: record.audio_codec.as_deref(),
                    width: record.width,
                    height: record.height,
                    camera_make: record.camera_make.as_deref(),
                    camera_model: record.camera_model.as_deref(),
                    summary: record.report.as_ref().map(|r| r.summary.as_str()),
                    analysis: record.analysis.as_ref(),
                },
            )?;

            let segment_count = match record.report {
                Some(ref report) if outcome.analysis_written => {
                    let scenes: Vec<NewSegment<'_>> = report
                        .scenes
                        .iter()
                        .map(|s| NewSegment {
                            start_secs: s.start_secs,
                            end_secs: s.end_secs,
                            description: &s.description,
                        })
                        .collect();
                    segments::replace_segments(conn, outcome.media.id, &scenes)?.len()
                }
                // A linked ingest keeps the stored analysis and its scenes.
                _ => segments::list_segments(conn, outcome.media.id)?.len(),
            };
            Ok((outcome, segment_count))
        })
        .await?;

        tracing::info!(
            file_id = %ctx.file_id,
            media_id = %outcome.media.id,
            created = outcome.created,
            segments = segment_count,
            "Media stored"
        );
        bag.set("media_id", outcome.media.id.to_string());
        bag.set("linked", !outcome.created);
        bag.set("segments", segment_count as i64);
        Ok(StepOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::DataBag;
    use mf_core::{FileId, MediaId};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx(path: &str) -> StepContext {
        StepContext {
            file_id: FileId::new(),
            path: path.into(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    fn seeded(sha: &str) -> DataBag {
        let mut bag = DataBag::new();
        {
            let mut c = bag.scoped("checksum");
            c.set("sha256", sha);
            c.set("size_bytes", 1024i64);
        }
        {
            let mut m = bag.scoped("metadata");
            m.set("container", "mov");
            m.set("width", 1920u32);
            m.set("camera_make", "Apple");
        }
        bag
    }

    #[tokio::test]
    async fn second_ingest_links_instead_of_duplicating() {
        let pool = mf_db::init_memory_pool().unwrap();
        let step = StoreStep::new(pool.clone());

        let mut first = seeded("cafe");
        step.run(&ctx("/media/a.mov"), &mut first.scoped("store")).await.unwrap();
        let mut second = seeded("cafe");
        step.run(&ctx("/backup/a.mov"), &mut second.scoped("store")).await.unwrap();

        assert_eq!(first.bool("store.linked"), Some(false));
        assert_eq!(second.bool("store.linked"), Some(true));
        assert_eq!(first.text("store.media_id"), second.text("store.media_id"));

        let conn = mf_db::get_conn(&pool).unwrap();
        assert_eq!(media::count_media(&conn).unwrap(), 1);
        let id: MediaId = first.text("store.media_id").unwrap().parse().unwrap();
        assert_eq!(media::list_sources(&conn, id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn scenes_become_segments() {
        let pool = mf_db::init_memory_pool().unwrap();
        let mut bag = seeded("beef");
        bag.scoped("analyze").set(
            "report",
            json!({
                "summary": "sunset timelapse",
                "scenes": [
                    { "start_secs": 0.0, "end_secs": 5.0, "description": "sun above horizon" },
                    { "start_secs": 5.0, "end_secs": 10.0, "description": "dusk" }
                ]
            }),
        );

        StoreStep::new(pool.clone())
            .run(&ctx("/media/sunset.mp4"), &mut bag.scoped("store"))
            .await
            .unwrap();
        assert_eq!(bag.integer("store.segments"), Some(2));

        let conn = mf_db::get_conn(&pool).unwrap();
        let id: MediaId = bag.text("store.media_id").unwrap().parse().unwrap();
        let stored = media::get_media(&conn, id).unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("sunset timelapse"));
        let segs = segments::list_segments(&conn, id).unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[1].description, "dusk");
    }

    fn with_report(sha: &str, summary: &str, scene: &str) -> DataBag {
        let mut bag = seeded(sha);
        bag.scoped("analyze").set(
            "report",
            json!({
                "summary": summary,
                "scenes": [{ "start_secs": 0.0, "end_secs": 4.0, "description": scene }]
            }),
        );
        bag
    }

    /// A linked ingest with a different analysis leaves the stored summary
    /// and its segments together.
    #[tokio::test]
    async fn linked_ingest_keeps_stored_segments() {
        let pool = mf_db::init_memory_pool().unwrap();
        let step = StoreStep::new(pool.clone());

        let mut first = with_report("same", "a beach at noon", "beach");
        step.run(&ctx("/media/a.mov"), &mut first.scoped("store")).await.unwrap();
        let mut second = with_report("same", "a kitchen", "kitchen");
        step.run(&ctx("/backup/a.mov"), &mut second.scoped("store")).await.unwrap();

        assert_eq!(second.bool("store.linked"), Some(true));
        assert_eq!(second.integer("store.segments"), Some(1));

        let conn = mf_db::get_conn(&pool).unwrap();
        let id: MediaId = first.text("store.media_id").unwrap().parse().unwrap();
        let stored = media::get_media(&conn, id).unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("a beach at noon"));
        let segs = segments::list_segments(&conn, id).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].description, "beach");
    }

    /// A record stored without analysis takes the first analysis that
    /// arrives, scenes included.
    #[tokio::test]
    async fn linked_ingest_fills_missing_analysis() {
        let pool = mf_db::init_memory_pool().unwrap();
        let step = StoreStep::new(pool.clone());

        let mut bare = seeded("late");
        step.run(&ctx("/media/a.mov"), &mut bare.scoped("store")).await.unwrap();
        assert_eq!(bare.integer("store.segments"), Some(0));

        let mut analysed = with_report("late", "a kitchen", "kitchen");
        step.run(&ctx("/backup/a.mov"), &mut analysed.scoped("store")).await.unwrap();
        assert_eq!(analysed.integer("store.segments"), Some(1));

        let conn = mf_db::get_conn(&pool).unwrap();
        let id: MediaId = bare.text("store.media_id").unwrap().parse().unwrap();
        let segs = segments::list_segments(&conn, id).unwrap();
        assert_eq!(segs[0].description, "kitchen");
    }

    #[tokio::test]
    async fn missing_container_fails() {
        let pool = mf_db::init_memory_pool().unwrap();
        let mut bag = DataBag::new();
        bag.scoped("checksum").set("sha256", "f00d");
        let err = StoreStep::new(pool)
            .run(&ctx("/media/x.mov"), &mut bag.scoped("store"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingRequiredInput { ref field, .. } if field == "metadata.container"));
    }
}
