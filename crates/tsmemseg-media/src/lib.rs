//! tsmemseg-media: MPEG-2 TS parsing, keyframe segmentation and fMP4
//! fragmentation.
//!
//! This crate holds everything that operates on bytes alone; endpoint
//! publishing and I/O live in the `tsmemseg` binary crate.
//!
//! # Modules
//!
//! - `bits` - bit cursor, exp-Golomb, CRC-32/MPEG-2, EBSP/RBSP
//! - `ts` - TS packet fields, PSI (PAT/PMT), PES headers, NAL scanning
//! - `segmenter` - keyframe-aligned segment / partial-segment cutting
//! - `fmp4` - fragmented-MP4 packaging of the segmenter's output
//!
//! # Pipeline
//!
//! Feed 188-byte packets to [`segmenter::Segmenter`]; each emitted
//! [`segmenter::Cut`] is either published as-is (TS mode) or run through
//! [`fmp4::Fragmenter`] (fMP4 mode) before publishing.

pub mod bits;
pub mod error;
pub mod fmp4;
pub mod segmenter;
pub mod ts;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
pub use fmp4::Fragmenter;
pub use segmenter::{Cut, CutKind, Segmenter, SegmenterConfig};
