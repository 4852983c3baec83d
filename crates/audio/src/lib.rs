//! Audio render device for the montage engine: the pull-model byte
//! stream seam and a cpal-backed output implementation.

pub mod output;

pub use output::{AudioRender, ByteStream, CpalAudioRender, PcmFormat};
