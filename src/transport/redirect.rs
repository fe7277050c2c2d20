use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use super::message::{CallbackMessage, MessageBus};
use super::{RawAssertion, SignInTransport, TransportOutcome};
use crate::error::Error;
use crate::provider::ProviderConfig;
use crate::store::{PendingSignIn, SessionStore};

/// Parameters the provider appends to the redirect return address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackParams(pub BTreeMap<String, String>);

impl CallbackParams {
    /// Read the query string of `url`.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        url.query_pairs().into_owned().collect()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Provider error code; its presence short-circuits to failure.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.get("error")
    }

    #[must_use]
    pub fn state(&self) -> Option<&str> {
        self.get("state")
    }

    /// Encode as a query string (`a=1&b=2`).
    #[must_use]
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// The cross-window message equivalent of these parameters.
    #[must_use]
    pub fn to_message(&self) -> CallbackMessage {
        let state = self.state().map(str::to_owned);
        match self.error() {
            Some(error) => CallbackMessage::SignInError {
                error: error.to_owned(),
                state,
            },
            None => CallbackMessage::SignInSuccess {
                data: self.to_fields(),
                state,
            },
        }
    }

    fn to_fields(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect()
    }
}

impl FromIterator<(String, String)> for CallbackParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What the page at the return address does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectAction {
    /// The result was posted to the opener; close this window.
    CloseWindow,
    /// No opener: go to the entry route, which resumes from the parameters.
    Navigate(String),
}

/// Complete a redirect on the page at the return address.
///
/// With a live `opener`, the parameters are forwarded over the same message
/// contract the popup strategy listens on, from `origin`. Without one, the
/// page navigates to `entry_route` carrying the same parameters so a
/// [`RedirectTransport`] can resume there.
///
/// The navigation URL then holds the `id_token` and `code`, which end up in
/// browser history and access logs. Servers that share a [`SessionStore`]
/// with the entry route should use [`stash_return`] instead.
#[must_use]
pub fn handle_return(
    params: &CallbackParams,
    opener: Option<&MessageBus>,
    origin: &str,
    entry_route: &str,
) -> RedirectAction {
    if let Some(error) = params.error() {
        warn!(error = %error, "Identity provider returned an error");
    }

    match opener {
        Some(bus) => {
            debug!("Forwarding sign-in result to opener");
            bus.post(origin, &params.to_message());
            RedirectAction::CloseWindow
        }
        None => {
            let query = params.to_query();
            if query.is_empty() {
                RedirectAction::Navigate(entry_route.to_owned())
            } else {
                RedirectAction::Navigate(format!("{entry_route}?{query}"))
            }
        }
    }
}

/// Complete a redirect without an opener by stashing the parameters in
/// `store` and navigating to the bare `entry_route`, where
/// [`RedirectTransport::resume_stashed`] picks them up.
///
/// # Errors
///
/// Returns [`Error::Storage`] if the parameters cannot be persisted.
pub fn stash_return(
    params: &CallbackParams,
    store: &SessionStore,
    entry_route: &str,
) -> Result<RedirectAction, Error> {
    if let Some(error) = params.error() {
        warn!(error = %error, "Identity provider returned an error");
    }
    store.stash_callback(params)?;
    debug!("Stashed sign-in result for the entry route");
    Ok(RedirectAction::Navigate(entry_route.to_owned()))
}

/// Sign-in by full navigation to the provider and back.
///
/// Call [`prepare`](Self::prepare) before navigating away; after the
/// provider returns (and the page or process has restarted), build the
/// transport with [`resume`](Self::resume) and call `begin`.
#[derive(Debug)]
pub struct RedirectTransport {
    params: CallbackParams,
    pending: Option<PendingSignIn>,
    finished: bool,
}

impl RedirectTransport {
    /// Persist fresh `state`/`nonce` and return the URL to navigate to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the pending state cannot be persisted.
    pub fn prepare(provider: &ProviderConfig, store: &SessionStore) -> Result<Url, Error> {
        let request = provider.authorization_request();
        store.stash_pending(&PendingSignIn::new(request.state, request.nonce))?;
        info!("Redirecting to identity provider");
        Ok(request.url)
    }

    /// Rehydrate from the URL the provider navigated back to, consuming the
    /// pending state saved by [`prepare`](Self::prepare).
    #[must_use]
    pub fn resume(return_url: &Url, store: &SessionStore) -> Self {
        Self::from_params(CallbackParams::from_url(return_url), store.take_pending())
    }

    /// Rehydrate from parameters stashed by [`stash_return`], consuming them
    /// along with the pending state.
    #[must_use]
    pub fn resume_stashed(store: &SessionStore) -> Self {
        let params = store.take_callback().unwrap_or_default();
        Self::from_params(params, store.take_pending())
    }

    #[must_use]
    pub fn from_params(params: CallbackParams, pending: Option<PendingSignIn>) -> Self {
        Self {
            params,
            pending,
            finished: false,
        }
    }

    /// Raw nonce of the attempt being resumed, for checking the `nonce`
    /// claim of the returned `id_token`.
    #[must_use]
    pub fn nonce(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.nonce.as_str())
    }

    fn outcome(&self) -> TransportOutcome {
        if let Some(error) = self.params.error() {
            return TransportOutcome::Failed(error.to_owned());
        }

        let expected = self.pending.as_ref().map(|p| p.state.as_str());
        match (expected, self.params.state()) {
            (Some(expected), Some(received)) if expected == received => {}
            _ => {
                warn!("Redirect state mismatch");
                return TransportOutcome::Failed("state_mismatch".into());
            }
        }

        if self.params.get("id_token").is_none_or(str::is_empty) {
            return TransportOutcome::Failed("missing_id_token".into());
        }
        TransportOutcome::Success(RawAssertion(self.params.to_fields()))
    }
}

impl SignInTransport for RedirectTransport {
    async fn begin(&mut self) -> TransportOutcome {
        if self.finished {
            return TransportOutcome::Failed("sign-in attempt already started".into());
        }
        self.finished = true;
        self.outcome()
    }

    fn nonce(&self) -> Option<&str> {
        RedirectTransport::nonce(self)
    }
}
