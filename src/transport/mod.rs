//! How a sign-in attempt completes.
//!
//! Two strategies share one contract, [`SignInTransport::begin`], which
//! resolves to exactly one [`TransportOutcome`]:
//!
//! - [`PopupTransport`]: the provider runs in a popup window that reports back
//!   over the cross-window [`MessageBus`].
//! - [`RedirectTransport`]: the provider navigates the whole page away and back;
//!   state is rehydrated from the [`SessionStore`](crate::SessionStore) on return.

mod message;
mod popup;
mod redirect;

use std::future::Future;

use serde_json::{Map, Value};

use crate::error::Error;
use crate::types::{IdentityAssertion, ProfileHint};

pub use message::{CallbackMessage, MessageBus, MessageFilter, WindowMessage};
pub use popup::{PopupLauncher, PopupState, PopupTransport, PopupWindow};
pub use redirect::{CallbackParams, RedirectAction, RedirectTransport, handle_return, stash_return};

/// Result of one sign-in attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOutcome {
    /// The provider produced an assertion.
    Success(RawAssertion),
    /// The user closed the popup or otherwise aborted.
    Cancelled,
    /// Provider-side failure or unusable result.
    Failed(String),
}

/// Assertion fields exactly as the provider returned them.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAssertion(pub Map<String, Value>);

impl RawAssertion {
    /// Normalize into an [`IdentityAssertion`].
    ///
    /// Accepts both the flat shape `{ id_token, code, user }` and the
    /// provider SDK shape `{ authorization: { id_token, code }, user }`.
    /// `user` may be an object or a JSON-encoded string (form posts).
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportFailed`] if no non-empty `id_token` is present.
    pub fn into_assertion(self) -> Result<IdentityAssertion, Error> {
        let fields = self.0;
        let source = fields
            .get("authorization")
            .and_then(Value::as_object)
            .unwrap_or(&fields);

        let id_token = source
            .get("id_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::transport_failed("missing_id_token"))?
            .to_owned();
        let code = source
            .get("code")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_owned);
        let hint = fields.get("user").and_then(profile_hint);

        Ok(IdentityAssertion {
            id_token,
            authorization_code: code,
            profile_hint: hint,
        })
    }
}

fn profile_hint(user: &Value) -> Option<ProfileHint> {
    match user {
        Value::Object(map) => Some(ProfileHint(map.clone())),
        Value::String(encoded) => serde_json::from_str::<Map<String, Value>>(encoded)
            .ok()
            .map(ProfileHint),
        _ => None,
    }
}

/// Completion strategy for a sign-in attempt.
pub trait SignInTransport: Send {
    /// Run the attempt to its single terminal outcome.
    fn begin(&mut self) -> impl Future<Output = TransportOutcome> + Send;

    /// Raw nonce whose hash went into the authorization request, once known.
    ///
    /// The returned `id_token` carries the hash in its `nonce` claim.
    fn nonce(&self) -> Option<&str> {
        None
    }
}

/// Either strategy, for callers that pick one at runtime.
pub enum Transport<L: PopupLauncher> {
    Popup(PopupTransport<L>),
    Redirect(RedirectTransport),
}

impl<L: PopupLauncher> SignInTransport for Transport<L> {
    async fn begin(&mut self) -> TransportOutcome {
        match self {
            Self::Popup(popup) => popup.begin().await,
            Self::Redirect(redirect) => redirect.begin().await,
        }
    }

    fn nonce(&self) -> Option<&str> {
        match self {
            Self::Popup(popup) => SignInTransport::nonce(popup),
            Self::Redirect(redirect) => SignInTransport::nonce(redirect),
        }
    }
}
