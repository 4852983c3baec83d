//! Playback controller for the montage engine: staged pipeline threads
//! over bounded queues, synchronized audio/video output, synchronous seek
//! and asynchronous scrub with a frame cache.

pub mod cache;
pub mod player;
pub mod stream;

pub use player::{PlayMode, Player};
pub use stream::PlayerByteStream;
