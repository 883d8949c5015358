//! HTTP transport backend for remote disk images.
//!
//! Exposes an image served by an imaging daemon over HTTPS as a seekable
//! block device implementing [`barge_image::ImageBackend`]. The backend
//! negotiates server capabilities with a one-time OPTIONS probe, upgrades
//! the TLS connection to a local unix socket when both ends share a host,
//! and maps positional I/O onto plain HTTP verbs: ranged GET for reads,
//! PUT with `Content-Range` for writes, PATCH for zero and flush, and
//! `GET <path>/extents` for sparse and dirty range queries.

pub mod backend;
pub mod config;
pub mod options;
pub mod protocol;
pub mod transport;
pub mod url;

pub use backend::HttpBackend;
pub use config::ConnectOptions;
pub use options::ServerCapabilities;
pub use url::ImageUrl;
