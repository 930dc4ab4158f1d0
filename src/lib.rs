//! tsmemseg - in-memory TS segmenter for HLS/LL-HLS serving
//!
//! This library crate exposes the pipeline driver and publisher for
//! integration testing; the parsing and packaging layers live in
//! `tsmemseg-media`.

pub mod driver;
pub mod filter;
pub mod publisher;
pub mod shutdown;

#[cfg(unix)]
pub mod signal;
