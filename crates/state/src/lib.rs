//! Timeline model for the montage engine: clips and their managed
//! overlaps, video/audio tracks, the timeline output spec, per-clip
//! event-stack filters and the on-disk project container.

pub mod clip;
pub mod event;
pub mod ids;
pub mod overlap;
pub mod project;
pub mod timeline;
pub mod track;

pub use montage_media::error::{Error, Result};
