//! mediaflow: command-line front end for the ingest pipeline.
//!
//! The pipeline engine lives in `mf-pipeline`; this crate adds the HTTP
//! analysis client, the wiring from configuration and the batch summary.

pub mod analysis_client;
pub mod app;
pub mod summary;
