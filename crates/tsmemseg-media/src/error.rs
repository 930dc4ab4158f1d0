//! Error types for tsmemseg-media.

use thiserror::Error;

/// Result type for tsmemseg-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for tsmemseg-media operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A bitstream parser ran past the end of its buffer.
    #[error("bitstream overrun while parsing {0}")]
    BitstreamOverrun(&'static str),

    /// A NAL unit was too short to carry the expected syntax.
    #[error("truncated NAL unit: need {need} bytes, have {have}")]
    TruncatedNal { need: usize, have: usize },
}
