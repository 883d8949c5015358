//! Backend contract for seekable disk image I/O.
//!
//! This crate defines the interface shared by all image transfer backends:
//! the [`ImageBackend`] trait (positional read/write/zero/flush plus extent
//! queries), the [`Extent`] sum type describing sparse and dirty ranges, the
//! shared [`ImageError`] type, and an in-memory [`MemoryBackend`] with
//! trivial buffer semantics for tests and local pipelines.

pub mod backend;
pub mod extent;
pub mod memory;

pub use backend::ImageBackend;
pub use extent::Extent;
pub use memory::MemoryBackend;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    /// The transport to the server could not be established.
    #[error("connection error: {0}")]
    Connection(String),
    /// The server violated the wire protocol: unexpected status, bad
    /// content length, truncated or malformed body.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The caller asked for a capability the backend does not have.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("image I/O error: {0}")]
    Io(#[from] std::io::Error),
}
