use url::Url;

use crate::error::Error;
use crate::nonce;

const DEFAULT_AUTH_URL: &str = "https://appleid.apple.com/auth/authorize";

/// Identity provider configuration.
///
/// Required fields are constructor parameters, so there are no runtime "missing field" errors.
///
/// ```rust,ignore
/// use signin_session::ProviderConfig;
///
/// let provider = ProviderConfig::new("com.example.web", "https://example.com/auth/identity/callback".parse()?)
///     .with_scopes(vec!["email".into()]);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ProviderConfig {
    pub(crate) client_id: String,
    pub(crate) auth_url: Url,
    pub(crate) redirect_uri: Url,
    pub(crate) scopes: Vec<String>,
    pub(crate) response_mode: String,
}

/// Authorization URL plus the values to keep until the provider answers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: String,
    /// Raw nonce; only its hash is in `url`.
    pub nonce: String,
}

impl ProviderConfig {
    /// Create a provider configuration.
    ///
    /// Defaults: Apple's authorize endpoint, scopes `["email", "name"]`,
    /// response mode `form_post`.
    #[must_use]
    pub fn new(client_id: impl Into<String>, redirect_uri: Url) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri,
            auth_url: DEFAULT_AUTH_URL.parse().expect("valid default URL"),
            scopes: vec!["email".into(), "name".into()],
            response_mode: "form_post".into(),
        }
    }

    /// Create the provider configuration from environment variables.
    ///
    /// # Required env vars
    /// - `IDP_CLIENT_ID`: provider client (service) ID
    /// - `IDP_REDIRECT_URI`: redirect return address (must be a valid URL)
    ///
    /// # Optional env vars
    /// - `IDP_AUTH_URL`: override the authorize endpoint
    /// - `IDP_SCOPES`: space- or comma-separated scopes
    /// - `IDP_RESPONSE_MODE`: `form_post`, `query` or `fragment`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required env vars are missing or URLs are invalid.
    pub fn from_env() -> Result<Self, Error> {
        let client_id = std::env::var("IDP_CLIENT_ID")
            .map_err(|_| Error::Config("IDP_CLIENT_ID is required".into()))?;
        let redirect_uri: Url = std::env::var("IDP_REDIRECT_URI")
            .map_err(|_| Error::Config("IDP_REDIRECT_URI is required".into()))?
            .parse()
            .map_err(|e| Error::Config(format!("IDP_REDIRECT_URI: {e}")))?;

        let mut config = Self::new(client_id, redirect_uri);

        if let Ok(url_str) = std::env::var("IDP_AUTH_URL") {
            let url: Url = url_str
                .parse()
                .map_err(|e| Error::Config(format!("IDP_AUTH_URL: {e}")))?;
            config = config.with_auth_url(url);
        }
        if let Ok(scopes) = std::env::var("IDP_SCOPES") {
            config = config.with_scopes(
                scopes
                    .split([',', ' '])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            );
        }
        if let Ok(mode) = std::env::var("IDP_RESPONSE_MODE") {
            config = config.with_response_mode(mode);
        }

        Ok(config)
    }

    /// Override the provider's authorize endpoint.
    #[must_use]
    pub fn with_auth_url(mut self, url: Url) -> Self {
        self.auth_url = url;
        self
    }

    /// Override the requested scopes (default: `["email", "name"]`).
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Override how the provider returns its result (default: `form_post`).
    #[must_use]
    pub fn with_response_mode(mut self, mode: impl Into<String>) -> Self {
        self.response_mode = mode.into();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn auth_url(&self) -> &Url {
        &self.auth_url
    }

    /// Redirect return address.
    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    #[must_use]
    pub fn response_mode(&self) -> &str {
        &self.response_mode
    }

    /// Origin that callback messages must come from: the origin of the
    /// redirect return address.
    #[must_use]
    pub fn callback_origin(&self) -> String {
        self.redirect_uri.origin().ascii_serialization()
    }

    /// Generate an authorization URL with fresh `state` and `nonce` values.
    #[must_use]
    pub fn authorization_request(&self) -> AuthorizationRequest {
        let state = nonce::generate_state();
        let raw_nonce = nonce::generate_nonce();
        let url = self.authorization_url(&state, &nonce::hash_nonce(&raw_nonce));

        AuthorizationRequest {
            url,
            state,
            nonce: raw_nonce,
        }
    }

    fn authorization_url(&self, state: &str, hashed_nonce: &str) -> Url {
        let scope = self.scopes.join(" ");

        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code id_token")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("response_mode", &self.response_mode)
            .append_pair("state", state)
            .append_pair("nonce", hashed_nonce);
        if !scope.is_empty() {
            url.query_pairs_mut().append_pair("scope", &scope);
        }
        url
    }
}
