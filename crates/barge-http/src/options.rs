//! One-time server capability negotiation.

use crate::transport::{Connection, METHOD_NOT_ALLOWED, NO_CONTENT, OK};
use barge_image::ImageError;
use serde::Deserialize;
use std::path::PathBuf;

/// Optional protocol features a server instance supports, discovered with
/// an OPTIONS probe at open time and fixed for the backend's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub extents: bool,
    pub zero: bool,
    pub flush: bool,
    /// Local unix socket serving the same image, advertised for same-host
    /// transfers.
    pub unix_socket: Option<PathBuf>,
}

/// Probe the resource path with OPTIONS.
///
/// Older servers answer 405 (no OPTIONS at all) or 204 (no body); both mean
/// no optional features. Any other non-success status fails the open.
pub fn negotiate(con: &mut Connection, path: &str) -> Result<ServerCapabilities, ImageError> {
    let mut res = con.request("OPTIONS", path, &[], None)?;
    match res.status {
        METHOD_NOT_ALLOWED | NO_CONTENT => {
            res.drain()?;
            Ok(ServerCapabilities::default())
        }
        OK => {
            let body = res.bytes()?;
            Ok(parse_capabilities(&body))
        }
        status => Err(ImageError::Protocol(format!(
            "OPTIONS failed with status {status}: {}",
            res.error_text()
        ))),
    }
}

/// Parse an OPTIONS body, treating anything malformed as an empty
/// capability set. A backend must never fail to open because a newer or
/// older server describes its features in a shape we do not understand.
fn parse_capabilities(body: &[u8]) -> ServerCapabilities {
    #[derive(Debug, Default, Deserialize)]
    struct OptionsBody {
        #[serde(default)]
        features: Vec<String>,
        #[serde(default)]
        unix_socket: Option<PathBuf>,
    }

    let body: OptionsBody = serde_json::from_slice(body).unwrap_or_default();
    let has = |name: &str| body.features.iter().any(|f| f == name);
    ServerCapabilities {
        extents: has("extents"),
        zero: has("zero"),
        flush: has("flush"),
        unix_socket: body.unix_socket,
    }
}
