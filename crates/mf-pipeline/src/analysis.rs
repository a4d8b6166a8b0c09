//! Content analysis contract.
//!
//! The analysis service receives the compressed artifact and answers with a
//! fixed-schema [`AnalysisReport`]. Implementations classify their own
//! failures: network problems, rate limiting and server errors are transient
//! ([`mf_core::Error::analysis_transient`]), everything else is permanent.

use std::path::Path;

use async_trait::async_trait;
use mf_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Generative analysis backend.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, artifact: &Path) -> Result<AnalysisReport>;
}

/// Structured answer from the analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub summary: String,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub audio: AudioAnalysis,
    #[serde(default)]
    pub entities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub start_secs: f64,
    pub end_secs: f64,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioAnalysis {
    #[serde(default)]
    pub speech: bool,
    #[serde(default)]
    pub music: bool,
    pub transcript: Option<String>,
}

impl AnalysisReport {
    /// Decode and validate a raw service response.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let report: Self = serde_json::from_value(value)
            .map_err(|e| Error::analysis(format!("response does not match schema: {e}")))?;
        report.validate()?;
        Ok(report)
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.summary.trim().is_empty() {
            return Err(Error::analysis("summary is empty"));
        }
        for (i, scene) in self.scenes.iter().enumerate() {
            if !scene.start_secs.is_finite() || !scene.end_secs.is_finite() {
                return Err(Error::analysis(format!("scene {i} has a non-finite bound")));
            }
            if scene.start_secs < 0.0 || scene.end_secs < scene.start_secs {
                return Err(Error::analysis(format!(
                    "scene {i} has invalid bounds {}..{}",
                    scene.start_secs, scene.end_secs
                )));
            }
        }
        Ok(())
    }
}
