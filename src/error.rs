use thiserror::Error;

/// Main error type for the clipping pipelines
#[derive(Error, Debug)]
pub enum ClipError {
    /// Invalid or missing codec parameters; fatal to the affected track only
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No sample at or after a seek target
    #[error("Not found: {0}")]
    NotFound(String),

    /// Forwarded from a frame decoder
    #[error("Decode error: {0}")]
    Decode(String),

    /// Forwarded from a frame encoder
    #[error("Encode error: {0}")]
    Encode(String),

    /// Input byte stream failure; terminates the session
    #[error("Stream error: {0}")]
    Stream(String),

    /// Structural container problem (bad box layout, finalized writer, unknown track)
    #[error("Container error: {0}")]
    Container(String),

    /// An error reported by the `mp4` box engine
    #[error("MP4 error: {0}")]
    Mp4(#[from] mp4::Error),

    /// A standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be read or written
    #[error("Config file error: {0}")]
    Config(String),
}

impl ClipError {
    /// Errors that end the whole session rather than a single track.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClipError::Stream(_) | ClipError::Container(_) | ClipError::Mp4(_) | ClipError::Io(_)
        )
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ClipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ClipError::Stream("reader gone".into()).is_fatal());
        assert!(ClipError::Container("truncated moov".into()).is_fatal());
        assert!(!ClipError::Decode("bad slice".into()).is_fatal());
        assert!(!ClipError::Configuration("no codec".into()).is_fatal());
        assert!(!ClipError::NotFound("t=3.0".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = ClipError::NotFound("no sample at 12.5s".into());
        assert_eq!(err.to_string(), "Not found: no sample at 12.5s");
    }
}
