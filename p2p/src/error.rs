//! Address store errors.

use std::io;

use bitcoin::consensus::encode;

use thiserror::Error;

/// An error occurring while reading or writing an address store.
///
/// Everything else that can go wrong inside the stores (unroutable
/// input, full buckets) is absorbed where it happens and never
/// surfaces.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An encoding/decoding error.
    #[error("encode/decode error: {0}")]
    Encode(#[from] encode::Error),
}
