use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Method, Request, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::Error;
use crate::store::SessionStore;
use crate::types::{AccessToken, IdentityAssertion, Session, SessionEvent, UserProfile};

const EVENT_CAPACITY: usize = 16;
const FALLBACK_ERROR_MESSAGE: &str = "An error occurred";

/// Token-exchange success body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<UserProfile>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Outbound HTTP boundary to the backend.
///
/// Reads the session from the injected [`SessionStore`] to authorize requests
/// and clears it when the backend answers 401. It never persists a new
/// session itself.
pub struct AuthGateway {
    config: ClientConfig,
    http: reqwest::Client,
    store: Arc<SessionStore>,
    events: broadcast::Sender<SessionEvent>,
}

impl AuthGateway {
    #[must_use]
    pub fn new(config: ClientConfig, store: Arc<SessionStore>) -> Self {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config,
            http,
            store,
            events,
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribe to session lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn notify(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Exchange an identity assertion for a backend session.
    ///
    /// # Errors
    ///
    /// - [`Error::Unreachable`] if no response arrives
    /// - [`Error::ServerRejected`] on a non-2xx status
    /// - [`Error::MalformedResponse`] if a 2xx body is unusable
    pub async fn exchange_assertion(
        &self,
        assertion: &IdentityAssertion,
    ) -> Result<Session, Error> {
        let url = self.config.endpoint(&self.config.token_path)?;
        debug!(
            url = %url,
            first_consent = assertion.profile_hint.is_some(),
            "Exchanging identity assertion"
        );

        let response = self.dispatch(self.http.post(url).json(assertion)).await?;
        let response = Self::ensure_success(response).await?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;
        let access_token = AccessToken::try_from(body.access_token)
            .map_err(|_| Error::MalformedResponse("empty access_token".into()))?;

        Ok(Session {
            access_token,
            refresh_token: body.refresh_token,
            user: body.user,
        })
    }

    /// Attach the current access token as a bearer credential, if any.
    ///
    /// Replaces any `Authorization` header already on the request.
    pub fn authorize(&self, request: &mut Request) {
        let Some(session) = self.store.current() else {
            return;
        };
        match HeaderValue::from_str(&format!("Bearer {}", session.access_token.as_str())) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => warn!("Access token is not a valid header value; sending unauthenticated"),
        }
    }

    /// Start a request against the API base URL.
    ///
    /// The credential is attached when the request is dispatched through
    /// [`send`](Self::send), not here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `path` does not form a valid URL.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, Error> {
        let url = self.config.endpoint(path)?;
        Ok(self.http.request(method, url))
    }

    /// Dispatch a request with the current credential.
    ///
    /// Non-401 responses are returned as-is, whatever their status.
    ///
    /// # Errors
    ///
    /// - [`Error::Unreachable`] if no response arrives
    /// - [`Error::SessionExpired`] on 401, after the session has been cleared
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, Error> {
        let response = self.dispatch(request).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.on_unauthorized();
            return Err(Error::SessionExpired);
        }
        Ok(response)
    }

    async fn dispatch(&self, request: RequestBuilder) -> Result<Response, Error> {
        let mut request = request
            .build()
            .map_err(|e| Error::Config(format!("invalid request: {e}")))?;
        self.authorize(&mut request);
        self.http.execute(request).await.map_err(Error::Unreachable)
    }

    /// [`send`](Self::send), then require 2xx and decode the JSON body.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`Error::ServerRejected`] on other
    /// non-2xx statuses and [`Error::MalformedResponse`] on undecodable bodies.
    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, Error> {
        let response = Self::ensure_success(self.send(request).await?).await?;
        response
            .json()
            .await
            .map_err(|e| Error::MalformedResponse(e.to_string()))
    }

    /// Invalidate the session after a 401.
    ///
    /// Clears the store synchronously and broadcasts
    /// [`SessionEvent::Expired`] only if a session was actually removed, so
    /// simultaneous 401s produce a single logged-out transition.
    pub fn on_unauthorized(&self) {
        match self.store.clear() {
            Ok(true) => {
                warn!("Backend rejected the session; signed out");
                self.notify(SessionEvent::Expired);
            }
            Ok(false) => debug!("401 received with no session present"),
            Err(e) => warn!(error = %e, "Failed to clear session after 401"),
        }
    }

    /// Checks HTTP response status; returns the response on success or a
    /// classified rejection carrying the backend's `message`.
    async fn ensure_success(response: Response) -> Result<Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.message)
            .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
            .unwrap_or_else(|| FALLBACK_ERROR_MESSAGE.to_string());

        Err(Error::ServerRejected { status, message })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;
    use crate::types::{ProfileHint, UserId};

    fn gateway(base: &str) -> (AuthGateway, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::in_memory());
        let config = ClientConfig::new(base.parse().unwrap());
        (AuthGateway::new(config, store.clone()), store)
    }

    fn signed_in(store: &SessionStore, token: &str) {
        store.save(&Session::new(token.parse().unwrap())).unwrap();
    }

    #[tokio::test]
    async fn exchange_returns_session_without_persisting() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/identity/token"))
            .and(body_json(json!({ "id_token": "id-tok", "code": "c0de" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "T",
                "refresh_token": "R",
                "user": { "id": 1, "email": "a@example.com" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (gateway, store) = gateway(&server.uri());
        let assertion = IdentityAssertion::new("id-tok").with_authorization_code("c0de");
        let session = gateway.exchange_assertion(&assertion).await.unwrap();

        assert_eq!(session.access_token.as_str(), "T");
        assert_eq!(session.refresh_token.as_deref(), Some("R"));
        assert_eq!(session.user.unwrap().id, UserId::Number(1));
        assert_eq!(store.current(), None);
    }

    #[tokio::test]
    async fn exchange_forwards_profile_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/identity/token"))
            .and(body_json(json!({
                "id_token": "id-tok",
                "user": { "email": "new@example.com" }
            })))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({ "access_token": "T" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let hint = ProfileHint(
            json!({ "email": "new@example.com" })
                .as_object()
                .cloned()
                .unwrap(),
        );
        let (gateway, _) = gateway(&server.uri());
        let session = gateway
            .exchange_assertion(&IdentityAssertion::new("id-tok").with_profile_hint(hint))
            .await
            .unwrap();

        assert_eq!(session.user, None);
    }

    #[tokio::test]
    async fn exchange_rejection_carries_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/identity/token"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({ "message": "invalid token" })),
            )
            .mount(&server)
            .await;

        let (gateway, _) = gateway(&server.uri());
        let err = gateway
            .exchange_assertion(&IdentityAssertion::new("bad"))
            .await
            .unwrap_err();

        match err {
            Error::ServerRejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "invalid token");
            }
            other => panic!("expected ServerRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_without_message_uses_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (gateway, _) = gateway(&server.uri());
        let err = gateway
            .exchange_assertion(&IdentityAssertion::new("x"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ServerRejected { status: 500, ref message } if message == FALLBACK_ERROR_MESSAGE
        ));
    }

    #[tokio::test]
    async fn exchange_401_does_not_invalidate_existing_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({ "message": "bad assertion" })),
            )
            .mount(&server)
            .await;

        let (gateway, store) = gateway(&server.uri());
        signed_in(&store, "existing");

        let err = gateway
            .exchange_assertion(&IdentityAssertion::new("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ServerRejected { status: 401, .. }));
        assert!(store.is_authenticated());
    }

    #[tokio::test]
    async fn exchange_with_empty_access_token_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "" })))
            .mount(&server)
            .await;

        let (gateway, _) = gateway(&server.uri());
        let err = gateway
            .exchange_assertion(&IdentityAssertion::new("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_classified() {
        // Port 1 is never listening.
        let (gateway, _) = gateway("http://127.0.0.1:1");
        let err = gateway
            .exchange_assertion(&IdentityAssertion::new("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[tokio::test]
    async fn authenticated_request_carries_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(header("authorization", "Bearer T"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1 })))
            .expect(1)
            .mount(&server)
            .await;

        let (gateway, store) = gateway(&server.uri());
        signed_in(&store, "T");

        let me: serde_json::Value = gateway
            .send_json(gateway.request(Method::GET, "/me").unwrap())
            .await
            .unwrap();
        assert_eq!(me, json!({ "id": 1 }));
    }

    #[tokio::test]
    async fn anonymous_request_has_no_authorization_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/public"))
            .and(|req: &Request| !req.headers.contains_key("authorization"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (gateway, _) = gateway(&server.uri());
        let response = gateway
            .send(gateway.request(Method::GET, "/public").unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn unauthorized_response_clears_session_and_signals_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let (gateway, store) = gateway(&server.uri());
        signed_in(&store, "T");
        let mut events = gateway.subscribe();

        let (a, b) = tokio::join!(
            gateway.send(gateway.request(Method::GET, "/a").unwrap()),
            gateway.send(gateway.request(Method::GET, "/b").unwrap()),
        );

        assert!(matches!(a, Err(Error::SessionExpired)));
        assert!(matches!(b, Err(Error::SessionExpired)));
        assert_eq!(store.current(), None);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Expired);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_401_errors_leave_session_intact() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({ "message": "nope" })))
            .mount(&server)
            .await;

        let (gateway, store) = gateway(&server.uri());
        signed_in(&store, "T");

        let err = gateway
            .send_json::<serde_json::Value>(gateway.request(Method::GET, "/admin").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ServerRejected { status: 403, .. }));
        assert!(store.is_authenticated());
    }
}
