use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Form, Query, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;

use crate::provider::ProviderConfig;
use crate::store::SessionStore;
use crate::transport::{CallbackParams, MessageBus, RedirectAction, handle_return, stash_return};

const CLOSE_PAGE: &str = "<!doctype html><html><body>\
<p>Sign-in complete. You can close this window.</p>\
<script>window.close()</script>\
</body></html>";

/// Callback route configuration.
///
/// Path and origin default to those of the provider's redirect URI.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    path: String,
    entry_route: String,
    origin: String,
    opener: Option<MessageBus>,
    store: Option<Arc<SessionStore>>,
}

impl CallbackConfig {
    #[must_use]
    pub fn new(provider: &ProviderConfig) -> Self {
        Self {
            path: provider.redirect_uri().path().to_owned(),
            entry_route: "/".into(),
            origin: provider.callback_origin(),
            opener: None,
            store: None,
        }
    }

    /// Where to send the browser when no popup is waiting (default `/`).
    #[must_use]
    pub fn with_entry_route(mut self, route: impl Into<String>) -> Self {
        self.entry_route = route.into();
        self
    }

    /// Forward results to a popup transport listening on `bus`.
    #[must_use]
    pub fn with_opener(mut self, bus: MessageBus) -> Self {
        self.opener = Some(bus);
        self
    }

    /// Without an opener, hand results to the entry route through `store`
    /// rather than its query string.
    #[must_use]
    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }
}

struct CallbackState {
    entry_route: String,
    origin: String,
    opener: Option<MessageBus>,
    store: Option<Arc<SessionStore>>,
}

/// Create the router serving the redirect return address.
///
/// Accepts `GET` (query response mode) and `POST` (form_post response mode).
pub fn callback_routes(config: CallbackConfig) -> Router {
    let state = Arc::new(CallbackState {
        entry_route: config.entry_route,
        origin: config.origin,
        opener: config.opener,
        store: config.store,
    });

    Router::new()
        .route(&config.path, get(callback_query).post(callback_form))
        .with_state(state)
}

// ── Callback ───────────────────────────────────────────────────────

async fn callback_query(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Response {
    complete(&state, CallbackParams(params))
}

async fn callback_form(
    State(state): State<Arc<CallbackState>>,
    Form(params): Form<BTreeMap<String, String>>,
) -> Response {
    complete(&state, CallbackParams(params))
}

fn complete(state: &CallbackState, params: CallbackParams) -> Response {
    tracing::info!(
        has_error = params.error().is_some(),
        has_opener = state.opener.is_some(),
        "Identity provider callback received"
    );

    let action = match (&state.opener, &state.store) {
        (None, Some(store)) => stash_return(&params, store, &state.entry_route).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to stash sign-in result");
            RedirectAction::Navigate(format!("{}?error=server_error", state.entry_route))
        }),
        (opener, _) => handle_return(
            &params,
            opener.as_ref(),
            &state.origin,
            &state.entry_route,
        ),
    };

    match action {
        RedirectAction::CloseWindow => Html(CLOSE_PAGE).into_response(),
        RedirectAction::Navigate(to) => Redirect::to(&to).into_response(),
    }
}
