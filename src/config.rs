use std::time::Duration;

use url::Url;

use crate::error::Error;

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_TOKEN_PATH: &str = "/auth/identity/token";

/// Backend API configuration.
///
/// Use [`from_env()`](ClientConfig::from_env) for convention-based setup,
/// or [`new()`](ClientConfig::new) with `with_*` methods for full control.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) api_base_url: Url,
    pub(crate) token_path: String,
    pub(crate) request_timeout: Option<Duration>,
}

impl ClientConfig {
    /// Create config with the backend base URL.
    ///
    /// The token-exchange path defaults to `/auth/identity/token`; there is
    /// no request timeout unless one is set.
    #[must_use]
    pub fn new(api_base_url: Url) -> Self {
        Self {
            api_base_url,
            token_path: DEFAULT_TOKEN_PATH.into(),
            request_timeout: None,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Optional env vars
    /// - `SIGNIN_API_BASE_URL`: backend base URL (default `http://localhost:3000`)
    /// - `SIGNIN_TOKEN_PATH`: token-exchange path
    /// - `SIGNIN_REQUEST_TIMEOUT_SECS`: per-request timeout in seconds
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value is present but invalid.
    pub fn from_env() -> Result<Self, Error> {
        let base = std::env::var("SIGNIN_API_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string());
        let base: Url = base
            .parse()
            .map_err(|e| Error::Config(format!("SIGNIN_API_BASE_URL: {e}")))?;

        let mut config = Self::new(base);

        if let Ok(path) = std::env::var("SIGNIN_TOKEN_PATH") {
            config = config.with_token_path(path);
        }
        if let Ok(secs) = std::env::var("SIGNIN_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| Error::Config(format!("SIGNIN_REQUEST_TIMEOUT_SECS: {e}")))?;
            config = config.with_request_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_token_path(mut self, path: impl Into<String>) -> Self {
        self.token_path = path.into();
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn api_base_url(&self) -> &Url {
        &self.api_base_url
    }

    #[must_use]
    pub fn token_path(&self) -> &str {
        &self.token_path
    }

    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Resolve an API path against the base URL, keeping any base path prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the joined URL is invalid.
    pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
        let mut base = self.api_base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("invalid endpoint path {path:?}: {e}")))
    }
}
