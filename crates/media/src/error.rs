use ffmpeg_the_third as ffmpeg;

/// Result type used across the engine crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the timeline model, the media pipeline and the player
/// control surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no media has been opened")]
    NotOpened,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error("file is not usable: {0}")]
    FileInvalid(String),

    #[error("failed to create directory: {0}")]
    MkdirFailed(String),

    #[error("io failed: {0}")]
    IoFailed(#[from] std::io::Error),

    #[error("decoder unavailable: {0}")]
    DecoderUnavailable(String),

    #[error("hardware decoder unavailable: {0}")]
    HwUnavailable(String),

    #[error("media backend error: {0}")]
    Media(#[from] ffmpeg::Error),

    #[error("fatal pipeline error: {0}")]
    Fatal(String),
}

impl Error {
    pub fn invalid_range(msg: impl Into<String>) -> Self {
        Self::InvalidRange(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
