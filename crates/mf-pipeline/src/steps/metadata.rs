use std::sync::Arc;

use async_trait::async_trait;
use mf_av::MetadataExtractor;
use mf_core::{Error, Result};

use crate::bag::StepBag;
use crate::step::{Step, StepContext, StepOutcome};

/// Writes `metadata.*` from the configured extractor.
pub struct MetadataStep {
    extractor: Arc<dyn MetadataExtractor>,
}

impl MetadataStep {
    pub fn new(extractor: Arc<dyn MetadataExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl Step for MetadataStep {
    async fn run(&self, ctx: &StepContext, bag: &mut StepBag<'_>) -> Result<StepOutcome> {
        let meta = self.extractor.extract(&ctx.path).await?;
        tracing::debug!(
            file_id = %ctx.file_id,
            extractor = self.extractor.name(),
            container = %meta.container,
            "Metadata extracted"
        );

        let tracks = serde_json::to_value(&meta.tracks)
            .map_err(|e| Error::Internal(format!("failed to encode tracks: {e}")))?;

        bag.set("container", meta.container);
        bag.set_opt("duration_secs", meta.duration_secs);
        bag.set_opt("video_codec", meta.video_codec);
        bag.set_opt("audio_codec", meta.audio_codec);
        bag.set_opt("width", meta.width);
        bag.set_opt("height", meta.height);
        bag.set_opt("frame_rate", meta.frame_rate);
        bag.set_opt("camera_make", meta.camera_make);
        bag.set_opt("camera_model", meta.camera_model);
        bag.set_opt("creation_time", meta.creation_time);
        bag.set("tracks", tracks);
        Ok(StepOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::DataBag;
    use mf_av::metadata::TrackInfo;
    use mf_av::MediaMetadata;
    use mf_core::FileId;
    use std::path::{Path, PathBuf};
    use tokio_util::sync::CancellationToken;

    struct Fixed(Option<MediaMetadata>);

    #[async_trait]
    impl MetadataExtractor for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn extract(&self, _path: &Path) -> Result<MediaMetadata> {
            self.0
                .clone()
                .ok_or_else(|| Error::extraction("ffprobe", "moov atom not found"))
        }
    }

    fn ctx() -> StepContext {
        StepContext {
            file_id: FileId::new(),
            path: PathBuf::from("/media/IMG_0001.MOV"),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    fn iphone_clip() -> MediaMetadata {
        MediaMetadata {
            container: "mov".into(),
            duration_secs: Some(12.5),
            size_bytes: Some(4_000_000),
            video_codec: Some("hevc".into()),
            audio_codec: Some("aac".into()),
            width: Some(1920),
            height: Some(1080),
            frame_rate: Some(29.97),
            camera_make: Some("Apple".into()),
            camera_model: Some("iPhone 15 Pro".into()),
            creation_time: None,
            tracks: vec![TrackInfo {
                index: 0,
                kind: "video".into(),
                codec: Some("hevc".into()),
                language: None,
            }],
        }
    }

    #[tokio::test]
    async fn writes_metadata_fields() {
        let step = MetadataStep::new(Arc::new(Fixed(Some(iphone_clip()))));
        let mut bag = DataBag::new();
        let outcome = step.run(&ctx(), &mut bag.scoped("metadata")).await.unwrap();

        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(bag.text("metadata.container"), Some("mov"));
        assert_eq!(bag.integer("metadata.width"), Some(1920));
        assert_eq!(bag.float("metadata.duration_secs"), Some(12.5));
        assert_eq!(bag.text("metadata.camera_model"), Some("iPhone 15 Pro"));
        assert!(!bag.contains("metadata.creation_time"));
        assert_eq!(bag.json("metadata.tracks").unwrap()[0]["kind"], "video");
    }

    #[tokio::test]
    async fn extraction_error_propagates() {
        let step = MetadataStep::new(Arc::new(Fixed(None)));
        let mut bag = DataBag::new();
        let err = step.run(&ctx(), &mut bag.scoped("metadata")).await.unwrap_err();
        assert!(matches!(err, Error::Extraction { ref tool, .. } if tool == "ffprobe"));
        assert!(bag.keys_in("metadata").is_empty());
    }
}
