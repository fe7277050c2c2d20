use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::Error;
use crate::gateway::AuthGateway;
use crate::store::SessionStore;
use crate::transport::{SignInTransport, TransportOutcome};
use crate::types::{IdentityAssertion, Session, SessionEvent, UserProfile};

/// Coordinates sign-in, sign-out and session queries for the UI layer.
///
/// At most one sign-in runs at a time; a second attempt while one is
/// pending fails with [`Error::SignInInProgress`] instead of racing it.
pub struct AuthOrchestrator {
    gateway: Arc<AuthGateway>,
    store: Arc<SessionStore>,
    in_flight: AtomicBool,
}

/// Releases the in-flight flag on drop, including on cancellation.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, Error> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| Error::SignInInProgress)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AuthOrchestrator {
    /// `store` must be the same instance the gateway reads from.
    #[must_use]
    pub fn new(gateway: Arc<AuthGateway>, store: Arc<SessionStore>) -> Self {
        Self {
            gateway,
            store,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Exchange `assertion` for a session, persist it, and return it.
    ///
    /// # Errors
    ///
    /// Gateway failures propagate unchanged and leave the store untouched;
    /// [`Error::SignInInProgress`] if another sign-in is pending;
    /// [`Error::Storage`] if the session cannot be persisted.
    pub async fn sign_in(&self, assertion: IdentityAssertion) -> Result<Session, Error> {
        let _guard = InFlightGuard::acquire(&self.in_flight)?;
        self.exchange_and_save(&assertion).await
    }

    /// Run `transport` to completion, then sign in with its assertion.
    ///
    /// # Errors
    ///
    /// [`Error::TransportCancelled`] / [`Error::TransportFailed`] for
    /// non-success outcomes (no exchange is attempted), otherwise as
    /// [`sign_in`](Self::sign_in).
    pub async fn sign_in_with<T: SignInTransport>(&self, transport: &mut T) -> Result<Session, Error> {
        let _guard = InFlightGuard::acquire(&self.in_flight)?;

        let assertion = match transport.begin().await {
            TransportOutcome::Success(raw) => raw.into_assertion()?,
            TransportOutcome::Cancelled => return Err(Error::TransportCancelled),
            TransportOutcome::Failed(reason) => return Err(Error::TransportFailed { reason }),
        };
        self.exchange_and_save(&assertion).await
    }

    /// Forget the session. Always succeeds from the caller's view; a storage
    /// failure is logged.
    pub fn sign_out(&self) {
        match self.store.clear() {
            Ok(true) => {
                info!("Signed out");
                self.gateway.notify(SessionEvent::SignedOut);
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to clear session on sign-out"),
        }
    }

    #[must_use]
    pub fn current_user(&self) -> Option<UserProfile> {
        self.store.current_user()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    /// Subscribe to session lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.gateway.subscribe()
    }

    async fn exchange_and_save(&self, assertion: &IdentityAssertion) -> Result<Session, Error> {
        let session = self.gateway.exchange_assertion(assertion).await.map_err(|e| {
            warn!(error = %e, "Token exchange failed");
            e
        })?;
        self.store.save(&session)?;

        info!(
            user_id = ?session.user.as_ref().map(|u| &u.id),
            "Sign-in successful"
        );
        self.gateway.notify(SessionEvent::SignedIn);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::ClientConfig;
    use crate::provider::ProviderConfig;
    use crate::transport::{
        CallbackMessage, MessageBus, PopupLauncher, PopupTransport, PopupWindow, RawAssertion,
    };
    use crate::types::UserId;

    fn orchestrator(base: &str) -> (AuthOrchestrator, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::in_memory());
        let gateway = Arc::new(AuthGateway::new(
            ClientConfig::new(base.parse().unwrap()),
            store.clone(),
        ));
        (AuthOrchestrator::new(gateway, store.clone()), store)
    }

    async fn token_endpoint(server: &MockServer, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/auth/identity/token"))
            .respond_with(response)
            .mount(server)
            .await;
    }

    /// Transport that resolves to a fixed outcome.
    struct Fixed(Option<TransportOutcome>);

    impl SignInTransport for Fixed {
        async fn begin(&mut self) -> TransportOutcome {
            self.0.take().unwrap_or(TransportOutcome::Cancelled)
        }
    }

    #[tokio::test]
    async fn sign_in_persists_session() {
        let server = MockServer::start().await;
        token_endpoint(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "T",
                "user": { "id": 1 }
            })),
        )
        .await;

        let (auth, store) = orchestrator(&server.uri());
        let mut events = auth.subscribe();

        let session = auth.sign_in(IdentityAssertion::new("id-tok")).await.unwrap();

        assert_eq!(store.current(), Some(session));
        assert!(auth.is_authenticated());
        assert_eq!(auth.current_user().unwrap().id, UserId::Number(1));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedIn);
    }

    #[tokio::test]
    async fn rejected_sign_in_leaves_store_untouched() {
        let server = MockServer::start().await;
        token_endpoint(
            &server,
            ResponseTemplate::new(422).set_body_json(json!({ "message": "invalid token" })),
        )
        .await;

        let (auth, store) = orchestrator(&server.uri());
        let previous = Session::new("old".parse().unwrap());
        store.save(&previous).unwrap();

        let err = auth.sign_in(IdentityAssertion::new("bad")).await.unwrap_err();

        assert!(matches!(
            err,
            Error::ServerRejected { status: 422, ref message } if message == "invalid token"
        ));
        assert_eq!(store.current(), Some(previous));
    }

    #[tokio::test]
    async fn failed_transport_never_calls_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (auth, store) = orchestrator(&server.uri());
        let mut transport = Fixed(Some(TransportOutcome::Failed("user_cancelled".into())));

        let err = auth.sign_in_with(&mut transport).await.unwrap_err();

        assert!(matches!(err, Error::TransportFailed { ref reason } if reason == "user_cancelled"));
        assert!(!store.is_authenticated());
    }

    /// Popup that reports a provider error as soon as it opens.
    struct ErrorPopup {
        bus: MessageBus,
        origin: String,
    }

    struct OpenWindow;

    impl PopupWindow for OpenWindow {
        fn is_closed(&self) -> bool {
            false
        }

        fn close(&mut self) {}
    }

    impl PopupLauncher for ErrorPopup {
        fn open(&self, _url: &url::Url) -> Result<Box<dyn PopupWindow>, Error> {
            self.bus.post(
                self.origin.clone(),
                &CallbackMessage::SignInError {
                    error: "user_cancelled_authorize".into(),
                    state: None,
                },
            );
            Ok(Box::new(OpenWindow))
        }
    }

    #[tokio::test]
    async fn popup_error_never_calls_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (auth, store) = orchestrator(&server.uri());
        let provider = ProviderConfig::new(
            "com.example.web",
            "https://app.example.com/auth/identity/callback".parse().unwrap(),
        );
        let bus = MessageBus::new();
        let launcher = ErrorPopup {
            bus: bus.clone(),
            origin: provider.callback_origin(),
        };
        let mut popup = PopupTransport::new(provider, launcher, bus);

        let err = auth.sign_in_with(&mut popup).await.unwrap_err();

        assert!(matches!(
            err,
            Error::TransportFailed { ref reason } if reason == "user_cancelled_authorize"
        ));
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn cancelled_transport_is_silent() {
        let (auth, _) = orchestrator("http://127.0.0.1:1");
        let err = auth
            .sign_in_with(&mut Fixed(Some(TransportOutcome::Cancelled)))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TransportCancelled));
        assert!(err.is_silent());
    }

    #[tokio::test]
    async fn successful_transport_signs_in() {
        let server = MockServer::start().await;
        token_endpoint(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": "T" })),
        )
        .await;

        let (auth, _) = orchestrator(&server.uri());
        let raw = RawAssertion(json!({ "id_token": "tok" }).as_object().cloned().unwrap());

        let session = auth
            .sign_in_with(&mut Fixed(Some(TransportOutcome::Success(raw))))
            .await
            .unwrap();
        assert_eq!(session.access_token.as_str(), "T");
    }

    #[tokio::test]
    async fn concurrent_sign_in_is_rejected() {
        let server = MockServer::start().await;
        token_endpoint(
            &server,
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "T" }))
                .set_delay(std::time::Duration::from_millis(200)),
        )
        .await;

        let (auth, _) = orchestrator(&server.uri());

        let (first, second) = tokio::join!(
            auth.sign_in(IdentityAssertion::new("a")),
            auth.sign_in(IdentityAssertion::new("b")),
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(Error::SignInInProgress)));

        // The guard is released afterwards.
        assert!(auth.sign_in(IdentityAssertion::new("c")).await.is_ok());
    }

    #[tokio::test]
    async fn sign_out_clears_and_is_idempotent() {
        let (auth, store) = orchestrator("http://127.0.0.1:1");
        store.save(&Session::new("T".parse().unwrap())).unwrap();
        let mut events = auth.subscribe();

        auth.sign_out();
        auth.sign_out();

        assert!(!auth.is_authenticated());
        assert_eq!(auth.current_user(), None);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedOut);
        assert!(events.try_recv().is_err());
    }
}
