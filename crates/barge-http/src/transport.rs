//! Byte-stream connections with HTTP/1.1 framing.
//!
//! A [`Connection`] owns exactly one underlying socket: TLS over TCP, plain
//! TCP, or a unix domain socket. Requests and responses are framed by
//! `Content-Length`; the connection is reused across requests and
//! transparently reconnects after [`Connection::disconnect`].

use crate::config::ConnectOptions;
use crate::url::{ImageUrl, Scheme};
use barge_image::ImageError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme, StreamOwned};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) const OK: u16 = 200;
pub(crate) const NO_CONTENT: u16 = 204;
pub(crate) const PARTIAL_CONTENT: u16 = 206;
pub(crate) const NOT_FOUND: u16 = 404;
pub(crate) const METHOD_NOT_ALLOWED: u16 = 405;

#[derive(Debug)]
enum Stream {
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
    Plain(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn tcp(&self) -> Option<&TcpStream> {
        match self {
            Stream::Tls(s) => Some(&s.sock),
            Stream::Plain(s) => Some(s),
            Stream::Unix(_) => None,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tls(s) => s.read(buf),
            Stream::Plain(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tls(s) => s.write(buf),
            Stream::Plain(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tls(s) => s.flush(),
            Stream::Plain(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// How to (re)establish the underlying socket.
#[derive(Debug)]
enum Connector {
    Tcp {
        host: String,
        port: u16,
        tls: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    },
    Unix {
        path: PathBuf,
    },
}

impl Connector {
    fn connect(&self) -> Result<Stream, ImageError> {
        match self {
            Connector::Tcp { host, port, tls } => {
                let mut sock = TcpStream::connect((host.as_str(), *port)).map_err(|e| {
                    ImageError::Connection(format!("cannot connect to {host}:{port}: {e}"))
                })?;
                let Some((config, name)) = tls else {
                    return Ok(Stream::Plain(sock));
                };
                let mut session = ClientConnection::new(Arc::clone(config), name.clone())
                    .map_err(|e| {
                        ImageError::Connection(format!("cannot create TLS session: {e}"))
                    })?;
                while session.is_handshaking() {
                    session.complete_io(&mut sock).map_err(|e| {
                        ImageError::Connection(format!(
                            "TLS handshake with {host}:{port} failed: {e}"
                        ))
                    })?;
                }
                Ok(Stream::Tls(Box::new(StreamOwned::new(session, sock))))
            }
            Connector::Unix { path } => {
                let sock = UnixStream::connect(path).map_err(|e| {
                    ImageError::Connection(format!(
                        "cannot connect to unix socket {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Stream::Unix(sock))
            }
        }
    }
}

/// One HTTP/1.1 connection to the imaging server.
#[derive(Debug)]
pub struct Connection {
    connector: Connector,
    authority: String,
    stream: Option<BufReader<Stream>>,
}

impl Connection {
    /// Establish a connection to the URL's network location. For `https`
    /// URLs the TLS session is fully handshaken before returning, so trust
    /// failures surface here and not on the first request.
    pub fn open(url: &ImageUrl, options: &ConnectOptions) -> Result<Self, ImageError> {
        let tls = match url.scheme() {
            Scheme::Https => {
                let config = tls_config(options)?;
                let name = ServerName::try_from(url.host().to_owned()).map_err(|e| {
                    ImageError::Connection(format!("invalid server name {:?}: {e}", url.host()))
                })?;
                Some((config, name))
            }
            Scheme::Http => None,
        };
        let mut con = Self {
            connector: Connector::Tcp {
                host: url.host().to_owned(),
                port: url.port(),
                tls,
            },
            authority: url.authority(),
            stream: None,
        };
        con.ensure_connected()?;
        Ok(con)
    }

    /// Connect to a local unix socket speaking the same HTTP protocol.
    pub fn unix(path: &Path) -> Result<Self, ImageError> {
        let mut con = Self {
            connector: Connector::Unix {
                path: path.to_path_buf(),
            },
            authority: "localhost".to_owned(),
            stream: None,
        };
        con.ensure_connected()?;
        Ok(con)
    }

    /// Whether the peer is on this host. Unix sockets are always local;
    /// TCP peers are local when both endpoints share an address.
    pub fn is_local(&mut self) -> Result<bool, ImageError> {
        self.ensure_connected()?;
        let Some(reader) = self.stream.as_ref() else {
            return Err(ImageError::Connection("not connected".to_owned()));
        };
        match reader.get_ref().tcp() {
            None => Ok(true),
            Some(sock) => Ok(sock.local_addr()?.ip() == sock.peer_addr()?.ip()),
        }
    }

    /// Resolved peer address, for logging and debugging.
    pub fn peer_address(&self) -> String {
        let Some(reader) = self.stream.as_ref() else {
            return "disconnected".to_owned();
        };
        match reader.get_ref() {
            Stream::Tls(s) => peer_of(&s.sock),
            Stream::Plain(s) => peer_of(s),
            Stream::Unix(s) => s
                .peer_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix".to_owned()),
        }
    }

    /// Drop the underlying socket. The next request reconnects.
    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    /// Send one request and parse the response head. The returned
    /// [`Response`] borrows the connection; its body must be consumed (or
    /// the connection disconnected) before the next request.
    pub fn request<'c>(
        &'c mut self,
        method: &str,
        path: &str,
        headers: &[(&str, String)],
        body: Option<&[u8]>,
    ) -> Result<Response<'c>, ImageError> {
        self.ensure_connected()?;
        let Some(reader) = self.stream.as_mut() else {
            return Err(ImageError::Connection("not connected".to_owned()));
        };

        let mut head = Vec::with_capacity(256);
        write!(head, "{method} {path} HTTP/1.1\r\n")?;
        write!(head, "host: {}\r\n", self.authority)?;
        for (name, value) in headers {
            write!(head, "{name}: {value}\r\n")?;
        }
        if let Some(body) = body {
            write!(head, "content-length: {}\r\n", body.len())?;
        }
        write!(head, "\r\n")?;

        let stream = reader.get_mut();
        stream.write_all(&head)?;
        if let Some(body) = body {
            stream.write_all(body)?;
        }
        stream.flush()?;

        Response::parse(reader)
    }

    fn ensure_connected(&mut self) -> Result<(), ImageError> {
        if self.stream.is_none() {
            let stream = self.connector.connect()?;
            self.stream = Some(BufReader::new(stream));
        }
        Ok(())
    }
}

fn peer_of(sock: &TcpStream) -> String {
    sock.peer_addr()
        .map_or_else(|_| "unknown".to_owned(), |a| a.to_string())
}

/// A parsed response head plus its unread body.
#[derive(Debug)]
pub struct Response<'c> {
    pub status: u16,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
    remaining: u64,
    reader: &'c mut BufReader<Stream>,
}

impl<'c> Response<'c> {
    fn parse(reader: &'c mut BufReader<Stream>) -> Result<Self, ImageError> {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.is_empty() {
            return Err(ImageError::Protocol(
                "connection closed before response".to_owned(),
            ));
        }
        let status = parse_status_line(line.trim_end())?;

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line)?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(ImageError::Protocol(format!(
                    "malformed response header: {line:?}"
                )));
            };
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }

        if headers.iter().any(|(name, _)| name == "transfer-encoding") {
            return Err(ImageError::Protocol(
                "chunked responses are not supported".to_owned(),
            ));
        }
        let content_length = match headers.iter().find(|(name, _)| name == "content-length") {
            Some((_, value)) => Some(value.parse::<u64>().map_err(|_| {
                ImageError::Protocol(format!("invalid content-length: {value:?}"))
            })?),
            None => None,
        };

        Ok(Self {
            status,
            headers,
            content_length,
            remaining: content_length.unwrap_or(0),
            reader,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// `Content-Length` as declared by the server, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Fill `buf` completely from the body, looping over partial socket
    /// reads. Premature end of body is a protocol error.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<(), ImageError> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.read_chunk(&mut buf[pos..])?;
            if n == 0 {
                return Err(ImageError::Protocol(format!(
                    "expected {} bytes, got {pos} bytes",
                    buf.len()
                )));
            }
            pos += n;
        }
        Ok(())
    }

    /// Read the remaining body.
    pub fn bytes(&mut self) -> Result<Vec<u8>, ImageError> {
        let mut body = Vec::with_capacity(self.remaining.min(64 * 1024) as usize);
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.read_chunk(&mut chunk)?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        Ok(body)
    }

    /// Discard the remaining body, keeping the connection reusable.
    pub fn drain(&mut self) -> Result<(), ImageError> {
        let mut chunk = [0u8; 8192];
        while self.read_chunk(&mut chunk)? > 0 {}
        Ok(())
    }

    /// Server-supplied diagnostic text, truncated to 512 bytes, for error
    /// messages.
    pub fn error_text(&mut self) -> String {
        match self.bytes() {
            Ok(body) => {
                let end = body.len().min(512);
                String::from_utf8_lossy(&body[..end]).into_owned()
            }
            Err(_) => String::new(),
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ImageError> {
        let cap = (buf.len() as u64).min(self.remaining) as usize;
        if cap == 0 {
            return Ok(0);
        }
        let n = self.reader.read(&mut buf[..cap])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn parse_status_line(line: &str) -> Result<u16, ImageError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let status = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(ImageError::Protocol(format!(
            "malformed status line: {line:?}"
        )));
    }
    status
        .parse::<u16>()
        .map_err(|_| ImageError::Protocol(format!("malformed status line: {line:?}")))
}

fn tls_config(options: &ConnectOptions) -> Result<Arc<ClientConfig>, ImageError> {
    let config = if options.secure {
        let mut roots = RootCertStore::empty();
        if let Some(path) = &options.cafile {
            let pem = std::fs::read(path).map_err(|e| {
                ImageError::Connection(format!("cannot read CA bundle {}: {e}", path.display()))
            })?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(|e| {
                    ImageError::Connection(format!(
                        "invalid certificate in {}: {e}",
                        path.display()
                    ))
                })?;
                roots.add(cert).map_err(|e| {
                    ImageError::Connection(format!(
                        "cannot trust certificate from {}: {e}",
                        path.display()
                    ))
                })?;
            }
        } else {
            let certs = rustls_native_certs::load_native_certs().map_err(|e| {
                ImageError::Connection(format!("cannot load system CA certificates: {e}"))
            })?;
            for cert in certs {
                // Skip certificates the platform store holds in formats
                // rustls cannot parse.
                let _ = roots.add(cert);
            }
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Accepts any server certificate. Installed only in insecure mode.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
