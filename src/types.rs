use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Backend-issued access token.
///
/// Guaranteed non-empty by construction: holding an `AccessToken` proves
/// the session is authenticated. Use `AccessToken::try_from(string)`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessToken(String);

impl AccessToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

impl TryFrom<String> for AccessToken {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            Err(Error::InvalidAccessToken)
        } else {
            Ok(Self(s))
        }
    }
}

impl std::str::FromStr for AccessToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl From<AccessToken> for String {
    fn from(t: AccessToken) -> Self {
        t.0
    }
}

/// Backend user identifier. The backend may send either a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[serde(untagged)]
pub enum UserId {
    #[display("{_0}")]
    Number(i64),
    #[display("{_0}")]
    Text(String),
}

/// Cached user profile returned by the token-exchange endpoint.
///
/// Opaque to the session core beyond key presence; unknown keys are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Identity-provider subject, sent by the backend as `appleId`.
    #[serde(
        default,
        rename = "appleId",
        alias = "external_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub external_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    /// Create a profile with only the required `id`.
    #[must_use]
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            full_name: None,
            email: None,
            phone: None,
            external_id: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_full_name(mut self, name: impl Into<String>) -> Self {
        self.full_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Backend-issued session.
///
/// An absent session (`None`) means unauthenticated; a present one always
/// carries a non-empty [`AccessToken`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: AccessToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

impl Session {
    #[must_use]
    pub fn new(access_token: AccessToken) -> Self {
        Self {
            access_token,
            refresh_token: None,
            user: None,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }
}

/// Profile data the identity provider hands out on a user's first consent
/// only. Forwarded to the backend verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct ProfileHint(pub Map<String, Value>);

/// Signed credential produced by the identity provider.
///
/// Serializes to the token-exchange request body
/// `{ id_token, code?, user? }`; absent optionals are omitted so the backend
/// can tell a returning user from a first sign-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityAssertion {
    pub id_token: String,
    #[serde(rename = "code", default, skip_serializing_if = "Option::is_none")]
    pub authorization_code: Option<String>,
    #[serde(rename = "user", default, skip_serializing_if = "Option::is_none")]
    pub profile_hint: Option<ProfileHint>,
}

impl IdentityAssertion {
    #[must_use]
    pub fn new(id_token: impl Into<String>) -> Self {
        Self {
            id_token: id_token.into(),
            authorization_code: None,
            profile_hint: None,
        }
    }

    #[must_use]
    pub fn with_authorization_code(mut self, code: impl Into<String>) -> Self {
        self.authorization_code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_profile_hint(mut self, hint: ProfileHint) -> Self {
        self.profile_hint = Some(hint);
        self
    }
}

/// Lifecycle notifications for the UI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new session was persisted.
    SignedIn,
    /// The user signed out.
    SignedOut,
    /// The backend rejected the session with 401; the UI must fall back to
    /// the unauthenticated state without an error banner.
    Expired,
}
