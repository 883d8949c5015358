//! Wire encoding of PATCH requests and decoding of extents responses.

use barge_image::backend::{CONTEXT_DIRTY, CONTEXT_ZERO};
use barge_image::{Extent, ImageError};
use serde::{Deserialize, Serialize};

/// Body of a PATCH request. Serializes to `{"op": "zero", ...}` or
/// `{"op": "flush"}`.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchRequest {
    Zero {
        offset: u64,
        size: u64,
        /// Ask the server to flush this zero to storage. Sent when the
        /// server cannot flush separately.
        flush: bool,
    },
    Flush,
}

/// Decode an extents response body for `context` into typed extents, in
/// listed order. The context-named flag is required on every record.
pub fn decode_extents(body: &[u8], context: &str) -> Result<Vec<Extent>, ImageError> {
    let map_err = |e: serde_json::Error| {
        ImageError::Protocol(format!("malformed {context} extents response: {e}"))
    };
    match context {
        CONTEXT_ZERO => {
            #[derive(Deserialize)]
            struct WireExtent {
                start: u64,
                length: u64,
                zero: bool,
                #[serde(default)]
                hole: bool,
            }
            let wire: Vec<WireExtent> = serde_json::from_slice(body).map_err(map_err)?;
            Ok(wire
                .into_iter()
                .map(|e| Extent::Zero {
                    start: e.start,
                    length: e.length,
                    zero: e.zero,
                    hole: e.hole,
                })
                .collect())
        }
        CONTEXT_DIRTY => {
            #[derive(Deserialize)]
            struct WireExtent {
                start: u64,
                length: u64,
                dirty: bool,
            }
            let wire: Vec<WireExtent> = serde_json::from_slice(body).map_err(map_err)?;
            Ok(wire
                .into_iter()
                .map(|e| Extent::Dirty {
                    start: e.start,
                    length: e.length,
                    dirty: e.dirty,
                })
                .collect())
        }
        other => Err(ImageError::InvalidArgument(format!(
            "invalid extents context: {other}"
        ))),
    }
}

/// Check that a full-image listing is well formed: non-empty, starting at
/// offset 0, every extent non-empty, ordered and contiguous.
///
/// Servers are trusted to report exhaustive ordered extents, and the image
/// size is derived from the last extent's end, so a listing violating the
/// invariant is rejected instead of silently corrupting range accounting.
pub fn validate_listing(extents: &[Extent]) -> Result<(), ImageError> {
    let Some(first) = extents.first() else {
        return Err(ImageError::Protocol("empty extents listing".to_owned()));
    };
    if first.start() != 0 {
        return Err(ImageError::Protocol(format!(
            "extents listing starts at {} instead of 0",
            first.start()
        )));
    }
    let mut end = 0;
    for extent in extents {
        if extent.length() == 0 {
            return Err(ImageError::Protocol(format!(
                "zero-length extent at offset {}",
                extent.start()
            )));
        }
        if extent.start() != end {
            return Err(ImageError::Protocol(format!(
                "extents listing not contiguous: expected offset {end}, got {}",
                extent.start()
            )));
        }
        end = extent.end();
    }
    Ok(())
}
