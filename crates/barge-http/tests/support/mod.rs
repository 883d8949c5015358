//! In-process imaging server double for backend tests.
//!
//! Speaks just enough of the wire protocol: OPTIONS capability probe,
//! ranged GET, PUT with `Content-Range`, PATCH zero/flush, and the
//! extents query. One in-memory image is shared by every listener, so a
//! unix socket listener observes writes made over TCP and vice versa.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data: Vec<u8>,
    /// Status for the OPTIONS probe. 200 answers with a feature body, 204
    /// and 405 with none, anything else with an error page.
    pub options_status: u16,
    pub features: Vec<&'static str>,
    /// Unix socket path advertised in the OPTIONS body.
    pub unix_socket: Option<PathBuf>,
    /// Raw override for the OPTIONS body, for malformed-body tests.
    pub options_body: Option<String>,
    /// JSON body for zero extents queries. Defaults to one data extent
    /// covering the image.
    pub zero_extents: Option<String>,
    /// JSON body for dirty extents queries. `None` answers 404.
    pub dirty_extents: Option<String>,
    /// Lie about the content length of ranged reads.
    pub lie_content_length: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            options_status: 200,
            features: Vec::new(),
            unix_socket: None,
            options_body: None,
            zero_extents: None,
            dirty_extents: None,
            lie_content_length: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub via: &'static str,
    pub method: String,
    pub target: String,
    pub body: Vec<u8>,
}

struct State {
    config: ServerConfig,
    requests: Vec<Request>,
}

pub struct ImageServer {
    pub url: String,
    state: Arc<Mutex<State>>,
}

impl ImageServer {
    /// Start a plain TCP listener serving `/images/test`.
    pub fn start(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/images/test", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(State {
            config,
            requests: Vec::new(),
        }));

        let accept_state = Arc::clone(&state);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = Arc::clone(&accept_state);
                std::thread::spawn(move || handle(stream, "tcp", &state));
            }
        });

        Self { url, state }
    }

    /// Start a TLS listener with a fresh self-signed certificate for
    /// `localhost`. Returns the server and the certificate PEM.
    pub fn start_tls(config: ServerConfig) -> (Self, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        let cert_pem = cert.cert.pem();
        let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![cert.cert.der().clone()],
                rustls::pki_types::PrivateKeyDer::Pkcs8(key),
            )
            .unwrap();
        let tls_config = Arc::new(tls_config);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("https://localhost:{port}/images/test");
        let state = Arc::new(Mutex::new(State {
            config,
            requests: Vec::new(),
        }));

        let accept_state = Arc::clone(&state);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(tcp) = stream else { break };
                let Ok(session) = rustls::ServerConnection::new(Arc::clone(&tls_config)) else {
                    continue;
                };
                let stream = rustls::StreamOwned::new(session, tcp);
                let state = Arc::clone(&accept_state);
                std::thread::spawn(move || handle(stream, "tls", &state));
            }
        });

        (Self { url, state }, cert_pem)
    }

    /// Serve the same image on a unix socket.
    pub fn serve_unix(&self, path: &Path) {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).unwrap();
        let accept_state = Arc::clone(&self.state);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = Arc::clone(&accept_state);
                std::thread::spawn(move || handle(stream, "unix", &state));
            }
        });
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn data(&self) -> Vec<u8> {
        self.state.lock().unwrap().config.data.clone()
    }

    pub fn extents_requests(&self, context: &str) -> usize {
        let suffix = format!("extents?context={context}");
        self.requests()
            .iter()
            .filter(|r| r.method == "GET" && r.target.ends_with(&suffix))
            .count()
    }
}

fn handle<S: Read + Write>(stream: S, via: &'static str, state: &Arc<Mutex<State>>) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
            break;
        }
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            break;
        };
        let method = method.to_owned();
        let target = target.to_owned();

        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                return;
            }
            if line.trim().is_empty() {
                break;
            }
            if let Some((name, value)) = line.trim().split_once(':') {
                headers.insert(name.trim().to_lowercase(), value.trim().to_owned());
            }
        }

        let content_length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; content_length];
        if content_length > 0 && reader.read_exact(&mut body).is_err() {
            return;
        }

        let response = {
            let mut state = state.lock().unwrap();
            state.requests.push(Request {
                via,
                method: method.clone(),
                target: target.clone(),
                body: body.clone(),
            });
            route(&mut state.config, &method, &target, &headers, &body)
        };

        if reader.get_mut().write_all(&response).is_err() {
            break;
        }
        let _ = reader.get_mut().flush();
    }
}

fn route(
    config: &mut ServerConfig,
    method: &str,
    target: &str,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> Vec<u8> {
    match method {
        "OPTIONS" => options_response(config),
        "GET" if target.contains("/extents?context=") => extents_response(config, target),
        "GET" => match headers.get("range") {
            Some(range) => ranged_read(config, range),
            None => respond(
                "200 OK",
                Some(config.data.len() as u64),
                config.data.clone(),
            ),
        },
        "PUT" => {
            let Some(offset) = headers
                .get("content-range")
                .and_then(|v| parse_content_range(v))
            else {
                return respond_text("400 Bad Request", "missing content-range");
            };
            let end = offset + body.len();
            if end > config.data.len() {
                config.data.resize(end, 0);
            }
            config.data[offset..end].copy_from_slice(body);
            respond("200 OK", Some(0), Vec::new())
        }
        "PATCH" => {
            let Ok(msg) = serde_json::from_slice::<serde_json::Value>(body) else {
                return respond_text("400 Bad Request", "bad json");
            };
            match msg["op"].as_str() {
                Some("zero") => {
                    let offset = msg["offset"].as_u64().unwrap_or(0) as usize;
                    let size = msg["size"].as_u64().unwrap_or(0) as usize;
                    if offset + size > config.data.len() {
                        config.data.resize(offset + size, 0);
                    }
                    config.data[offset..offset + size].fill(0);
                    respond("200 OK", Some(0), Vec::new())
                }
                Some("flush") => respond("200 OK", Some(0), Vec::new()),
                _ => respond_text("400 Bad Request", "unknown op"),
            }
        }
        _ => respond_text("405 Method Not Allowed", "nope"),
    }
}

fn options_response(config: &ServerConfig) -> Vec<u8> {
    match config.options_status {
        405 => respond_text("405 Method Not Allowed", ""),
        204 => respond("204 No Content", Some(0), Vec::new()),
        200 => {
            let body = config.options_body.clone().unwrap_or_else(|| {
                let mut msg = serde_json::json!({ "features": config.features });
                if let Some(path) = &config.unix_socket {
                    msg["unix_socket"] = serde_json::json!(path);
                }
                msg.to_string()
            });
            respond("200 OK", Some(body.len() as u64), body.into_bytes())
        }
        status => respond_text(&format!("{status} Error"), "options failed"),
    }
}

fn extents_response(config: &ServerConfig, target: &str) -> Vec<u8> {
    let context = target.rsplit('=').next().unwrap_or("");
    let body = match context {
        "zero" => Some(config.zero_extents.clone().unwrap_or_else(|| {
            format!(
                r#"[{{"start": 0, "length": {}, "zero": false}}]"#,
                config.data.len()
            )
        })),
        "dirty" => config.dirty_extents.clone(),
        _ => None,
    };
    match body {
        Some(body) => respond("200 OK", Some(body.len() as u64), body.into_bytes()),
        None => respond_text("404 Not Found", "no extents for you"),
    }
}

fn ranged_read(config: &ServerConfig, range: &str) -> Vec<u8> {
    let Some((start, end)) = parse_range(range) else {
        return respond_text("400 Bad Request", "bad range");
    };
    let start = (start as usize).min(config.data.len());
    let end = ((end + 1) as usize).min(config.data.len());
    let chunk = config.data[start..end].to_vec();
    let declared = config.lie_content_length.unwrap_or(chunk.len() as u64);
    respond("206 Partial Content", Some(declared), chunk)
}

/// `bytes=<start>-<end>` (inclusive).
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// `bytes <start>-<end>/*`, returning the start offset.
fn parse_content_range(value: &str) -> Option<usize> {
    let rest = value.strip_prefix("bytes ")?;
    let (start, _) = rest.split_once('-')?;
    start.parse().ok()
}

fn respond(status: &str, content_length: Option<u64>, body: Vec<u8>) -> Vec<u8> {
    let mut response = format!("HTTP/1.1 {status}\r\n").into_bytes();
    if let Some(length) = content_length {
        response.extend_from_slice(format!("content-length: {length}\r\n").as_bytes());
    }
    response.extend_from_slice(b"\r\n");
    response.extend_from_slice(&body);
    response
}

fn respond_text(status: &str, text: &str) -> Vec<u8> {
    respond(status, Some(text.len() as u64), text.as_bytes().to_vec())
}
