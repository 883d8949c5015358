use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Trust settings for opening a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// PEM bundle of CA certificates to trust for server verification.
    /// When unset, the platform's default trust store is used.
    #[serde(default)]
    pub cafile: Option<PathBuf>,
    /// Verify the server certificate. Disabling this is for development
    /// setups only.
    #[serde(default = "default_secure")]
    pub secure: bool,
}

fn default_secure() -> bool {
    true
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            cafile: None,
            secure: true,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cafile(mut self, path: &Path) -> Self {
        self.cafile = Some(path.to_path_buf());
        self
    }

    /// Disable server certificate verification.
    #[must_use]
    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }
}
