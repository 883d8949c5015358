//! The HTTP block I/O backend.

use crate::config::ConnectOptions;
use crate::options::{negotiate, ServerCapabilities};
use crate::protocol::{self, PatchRequest};
use crate::transport::{Connection, NOT_FOUND, OK, PARTIAL_CONTENT};
use crate::url::ImageUrl;
use barge_image::backend::{resolve_seek, CONTEXT_DIRTY, CONTEXT_ZERO};
use barge_image::{Extent, ImageBackend, ImageError};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use tracing::{debug, warn};

/// A remote disk image exposed as a seekable block device over HTTPS.
///
/// Holds one connection, the current byte offset, the capability flags
/// negotiated at open time, and a per-context extent cache that is never
/// invalidated within a session (the server-side image is assumed not to
/// change concurrently).
#[derive(Debug)]
pub struct HttpBackend {
    url: ImageUrl,
    con: Connection,
    caps: ServerCapabilities,
    position: u64,
    size: Option<u64>,
    extent_cache: HashMap<String, Vec<Extent>>,
    closed: bool,
}

impl HttpBackend {
    /// Open a backend for the image at `url`, negotiating capabilities and
    /// attempting the one-shot unix socket upgrade. A failed open never
    /// leaks a connection.
    ///
    /// `url` must use the `https` scheme in production; `http` is accepted
    /// for local development servers.
    pub fn open(url: &str, options: &ConnectOptions) -> Result<Self, ImageError> {
        let url = ImageUrl::parse(url)?;
        debug!(
            "open backend url={url} cafile={:?} secure={}",
            options.cafile, options.secure
        );
        let mut con = Connection::open(&url, options)?;
        let caps = match negotiate(&mut con, url.path()) {
            Ok(caps) => caps,
            Err(err) => {
                con.disconnect();
                return Err(err);
            }
        };
        debug!("server capabilities: {caps:?}");
        let con = optimize_connection(con, caps.unix_socket.as_deref());

        Ok(Self {
            url,
            con,
            caps,
            position: 0,
            size: None,
            extent_cache: HashMap::new(),
            closed: false,
        })
    }

    /// Capability flags negotiated at open time.
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.caps
    }

    /// Resolved peer address, for debugging.
    pub fn server_address(&self) -> String {
        self.con.peer_address()
    }

    fn patch(&mut self, msg: &PatchRequest) -> Result<(), ImageError> {
        let body = serde_json::to_vec(msg)
            .map_err(|e| ImageError::Protocol(format!("cannot encode {msg:?}: {e}")))?;
        let headers = [("content-type", "application/json".to_owned())];
        let mut res = self
            .con
            .request("PATCH", self.url.path(), &headers, Some(&body))?;
        if res.status != OK {
            let status = res.status;
            let text = res.error_text();
            return Err(ImageError::Protocol(format!(
                "PATCH {msg:?} failed with status {status}: {text}"
            )));
        }
        res.drain()
    }

    fn fetch_extents(&mut self, context: &str) -> Result<Vec<Extent>, ImageError> {
        let path = format!("{}/extents?context={context}", self.url.path());
        let mut res = self.con.request("GET", &path, &[], None)?;
        let status = res.status;
        let body = res.bytes()?;

        if status == NOT_FOUND {
            return Err(ImageError::Unsupported(format!(
                "server does not support {context} extents: {}",
                text_of(&body)
            )));
        }
        if status != OK {
            return Err(ImageError::Protocol(format!(
                "EXTENTS failed with status {status}: {}",
                text_of(&body)
            )));
        }

        let extents = protocol::decode_extents(&body, context)?;
        protocol::validate_listing(&extents)?;
        Ok(extents)
    }

    /// Learn the image size by requesting the whole image and reading only
    /// the declared content length. The connection is discarded without
    /// consuming the body and reconnects on the next request. Last resort;
    /// it is noisy on the server side.
    fn emulate_head(&mut self) -> Result<u64, ImageError> {
        let mut res = self.con.request("GET", self.url.path(), &[], None)?;
        if res.status != OK {
            let status = res.status;
            let text = res.error_text();
            return Err(ImageError::Protocol(format!(
                "GET failed with status {status}: {text}"
            )));
        }
        let Some(size) = res.content_length() else {
            return Err(ImageError::Protocol(
                "GET response without content length".to_owned(),
            ));
        };
        drop(res);
        debug!("discarding connection after size probe");
        self.con.disconnect();
        Ok(size)
    }
}

impl ImageBackend for HttpBackend {
    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize, ImageError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let length = buf.len() as u64;
        let end = self.position.checked_add(length - 1).ok_or_else(|| {
            ImageError::InvalidArgument(format!(
                "byte range {}+{length} overflows",
                self.position
            ))
        })?;
        let headers = [("range", format!("bytes={}-{end}", self.position))];
        let mut res = self.con.request("GET", self.url.path(), &headers, None)?;

        if res.status != PARTIAL_CONTENT {
            let status = res.status;
            let text = res.error_text();
            return Err(ImageError::Protocol(format!(
                "GET offset={} length={length} failed with status {status}: {text}",
                self.position,
            )));
        }
        if res.content_length() != Some(length) {
            return Err(ImageError::Protocol(format!(
                "unexpected content length {:?}, expected {length}",
                res.content_length()
            )));
        }
        res.read_into(buf)?;

        self.position += length;
        Ok(buf.len())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, ImageError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let length = buf.len() as u64;
        let end = self.position.checked_add(length - 1).ok_or_else(|| {
            ImageError::InvalidArgument(format!(
                "byte range {}+{length} overflows",
                self.position
            ))
        })?;
        // When the server can flush separately, ask it to defer flushing so
        // an explicit flush() decides durability.
        let path = if self.caps.flush {
            format!("{}?flush=n", self.url.path())
        } else {
            self.url.path().to_owned()
        };
        let headers = [
            ("content-type", "application/octet-stream".to_owned()),
            ("content-range", format!("bytes {}-{end}/*", self.position)),
        ];
        let mut res = self.con.request("PUT", &path, &headers, Some(buf))?;

        if res.status != OK {
            let status = res.status;
            let text = res.error_text();
            return Err(ImageError::Protocol(format!(
                "PUT offset={} length={length} failed with status {status}: {text}",
                self.position,
            )));
        }
        res.drain()?;

        self.position += length;
        Ok(buf.len())
    }

    fn zero(&mut self, length: u64) -> Result<u64, ImageError> {
        if length == 0 {
            return Ok(0);
        }
        self.patch(&PatchRequest::Zero {
            offset: self.position,
            size: length,
            flush: !self.caps.flush,
        })?;
        self.position += length;
        Ok(length)
    }

    fn flush(&mut self) -> Result<(), ImageError> {
        self.patch(&PatchRequest::Flush)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64, ImageError> {
        let size = match pos {
            SeekFrom::End(_) => self.size()?,
            SeekFrom::Start(_) | SeekFrom::Current(_) => 0,
        };
        self.position = resolve_seek(self.position, size, pos)?;
        Ok(self.position)
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn size(&mut self) -> Result<u64, ImageError> {
        // Two ways to learn the size: the end of the last extent, or a full
        // image GET read only for its content length. Extents are cheaper
        // and polite, so prefer them when the server has them.
        if let Some(size) = self.size {
            return Ok(size);
        }
        let size = if self.caps.extents {
            let extents = self.extents(CONTEXT_ZERO)?;
            extents.last().map_or(0, Extent::end)
        } else {
            self.emulate_head()?
        };
        self.size = Some(size);
        Ok(size)
    }

    fn extents(&mut self, context: &str) -> Result<Vec<Extent>, ImageError> {
        if context != CONTEXT_ZERO && context != CONTEXT_DIRTY {
            return Err(ImageError::InvalidArgument(format!(
                "invalid extents context: {context}"
            )));
        }

        if !self.caps.extents {
            if context == CONTEXT_ZERO {
                // Degrade to a single extent spanning the whole image, so
                // callers can always iterate zero extents. An empty image
                // has no extents at all.
                let size = self.size()?;
                if size == 0 {
                    return Ok(Vec::new());
                }
                return Ok(vec![Extent::Zero {
                    start: 0,
                    length: size,
                    zero: false,
                    hole: false,
                }]);
            }
            return Err(ImageError::Unsupported(
                "server does not support dirty extents".to_owned(),
            ));
        }

        if let Some(cached) = self.extent_cache.get(context) {
            return Ok(cached.clone());
        }
        let extents = self.fetch_extents(context)?;
        self.extent_cache.insert(context.to_owned(), extents.clone());
        Ok(extents)
    }

    fn close(&mut self) -> Result<(), ImageError> {
        if !self.closed {
            self.closed = true;
            debug!("close backend url={}", self.url);
            self.con.disconnect();
        }
        Ok(())
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if !self.closed {
            debug!("close backend url={}", self.url);
            self.con.disconnect();
        }
    }
}

/// Replace a TLS connection with a unix socket connection when the server
/// advertises one and the peer is this host. Best effort, attempted once
/// per backend; on any failure the original connection stays in use.
fn optimize_connection(mut con: Connection, unix_socket: Option<&Path>) -> Connection {
    let Some(path) = unix_socket else {
        return con;
    };
    match con.is_local() {
        Ok(true) => {}
        Ok(false) => return con,
        Err(err) => {
            warn!("cannot check if server is local: {err}");
            return con;
        }
    }
    match Connection::unix(path) {
        Ok(unix_con) => {
            debug!("using unix socket {}", path.display());
            con.disconnect();
            unix_con
        }
        Err(err) => {
            warn!("cannot use unix socket {}: {err}", path.display());
            con
        }
    }
}

fn text_of(body: &[u8]) -> String {
    let end = body.len().min(512);
    String::from_utf8_lossy(&body[..end]).into_owned()
}
