use barge_image::ImageError;
use std::fmt;

/// Connection security for a parsed image URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// TLS over TCP. The production scheme.
    Https,
    /// Plain TCP. For local development and tests.
    Http,
}

/// Destination of a remote image: network location plus resource path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUrl {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl ImageUrl {
    /// Parse a URL of the form `https://host[:port]/path`.
    ///
    /// Production image URLs use `https`; plain `http` is accepted for
    /// local development servers only. Any other scheme is rejected.
    pub fn parse(url: &str) -> Result<Self, ImageError> {
        let (scheme, rest) = match url.split_once("://") {
            Some(("https", rest)) => (Scheme::Https, rest),
            Some(("http", rest)) => (Scheme::Http, rest),
            Some((other, _)) => {
                return Err(ImageError::Connection(format!(
                    "unsupported URL scheme {other:?}, expected https"
                )))
            }
            None => {
                return Err(ImageError::InvalidArgument(format!(
                    "not a URL: {url:?}"
                )))
            }
        };

        let (netloc, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };

        let (host, port) = match netloc.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ImageError::InvalidArgument(format!("invalid port in URL: {url:?}"))
                })?;
                (host, port)
            }
            None => (netloc, scheme.default_port()),
        };
        if host.is_empty() {
            return Err(ImageError::InvalidArgument(format!(
                "missing host in URL: {url:?}"
            )));
        }

        Ok(Self {
            scheme,
            host: host.to_owned(),
            port,
            path: path.to_owned(),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, as sent in the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Https => 443,
            Scheme::Http => 80,
        }
    }
}

impl fmt::Display for ImageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Https => "https",
            Scheme::Http => "http",
        };
        write!(f, "{scheme}://{}:{}{}", self.host, self.port, self.path)
    }
}
