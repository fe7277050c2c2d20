/// Errors produced by the session core.
///
/// Every failure is classified, never swallowed: callers own the
/// user-facing message (see [`Error::user_message`]).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The backend could not be reached (connection refused, DNS, timeout).
    #[error("No response from server. Please check your connection.")]
    Unreachable(#[source] reqwest::Error),

    /// The backend answered with a non-2xx status.
    #[error("{message}")]
    ServerRejected { status: u16, message: String },

    /// A 2xx response whose body did not match the expected shape.
    #[error("Malformed server response: {0}")]
    MalformedResponse(String),

    /// The user closed the sign-in popup or aborted the flow.
    #[error("Sign-in was cancelled")]
    TransportCancelled,

    /// The identity provider reported a failure, or the transport produced
    /// an unusable result.
    #[error("Sign-in failed: {reason}")]
    TransportFailed { reason: String },

    /// An authenticated request was answered with 401; the session is gone.
    #[error("Session expired")]
    SessionExpired,

    /// Another sign-in attempt is still pending.
    #[error("A sign-in attempt is already in progress")]
    SignInInProgress,

    /// An access token must not be empty.
    #[error("Access token must not be empty")]
    InvalidAccessToken,

    /// Durable storage could not be written.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// `true` for outcomes that are part of the normal lifecycle and must
    /// not produce an error banner.
    #[must_use]
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::TransportCancelled | Self::SessionExpired)
    }

    /// Text to surface to the user, or `None` for silent outcomes.
    ///
    /// Backend rejection messages are surfaced verbatim; provider failures
    /// get a generic message.
    #[must_use]
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::TransportCancelled | Self::SessionExpired => None,
            Self::ServerRejected { message, .. } => Some(message.clone()),
            Self::TransportFailed { .. } => {
                Some("Sign-in was cancelled or failed".to_string())
            }
            other => Some(other.to_string()),
        }
    }

    pub(crate) fn transport_failed(reason: impl Into<String>) -> Self {
        Self::TransportFailed {
            reason: reason.into(),
        }
    }
}
