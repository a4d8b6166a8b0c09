//! Database query modules.

pub mod media;
pub mod segments;
