//! Cross-window message contract shared by the popup and the redirect page.
//!
//! ```json
//! { "type": "sign_in_success", "data": { ... }, "state": "..." }
//! { "type": "sign_in_error", "error": "user_cancelled", "state": "..." }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

const BUS_CAPACITY: usize = 32;

/// Typed body of a sign-in message; `type` is the sole discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallbackMessage {
    SignInSuccess {
        data: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
    SignInError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
}

impl CallbackMessage {
    /// The anti-forgery state carried by the message, looking inside `data`
    /// when the sender only forwarded raw parameters.
    #[must_use]
    pub fn state(&self) -> Option<&str> {
        match self {
            Self::SignInSuccess { data, state } => state
                .as_deref()
                .or_else(|| data.get("state").and_then(Value::as_str)),
            Self::SignInError { state, .. } => state.as_deref(),
        }
    }
}

/// A message as delivered by the platform channel: untyped, with the
/// sender's origin.
#[derive(Debug, Clone)]
pub struct WindowMessage {
    pub origin: String,
    pub body: Value,
}

/// The platform's generic cross-window channel.
///
/// Every subscriber sees every message, whatever its sender; receivers
/// must filter (see [`MessageFilter`]).
#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<WindowMessage>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Post a sign-in message from `origin`.
    pub fn post(&self, origin: impl Into<String>, message: &CallbackMessage) {
        match serde_json::to_value(message) {
            Ok(body) => self.post_raw(WindowMessage {
                origin: origin.into(),
                body,
            }),
            Err(e) => debug!(error = %e, "Unserializable callback message dropped"),
        }
    }

    /// Post an arbitrary message (other windows share the same channel).
    pub fn post_raw(&self, message: WindowMessage) {
        if self.tx.send(message).is_err() {
            debug!("Message posted with no listener");
        }
    }

    /// Register a listener. Only messages posted after this call are seen.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WindowMessage> {
        self.tx.subscribe()
    }
}

/// Accepts only sign-in messages from the expected origin that belong to
/// the current attempt.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    expected_origin: String,
    state: String,
}

impl MessageFilter {
    #[must_use]
    pub fn new(expected_origin: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            expected_origin: expected_origin.into(),
            state: state.into(),
        }
    }

    /// Returns the typed message if it is authoritative for this attempt.
    ///
    /// Rules: origin must match exactly; the body must parse; a success must
    /// carry the attempt's state; an error may omit its state but must not
    /// carry a different one.
    #[must_use]
    pub fn accept(&self, message: &WindowMessage) -> Option<CallbackMessage> {
        if message.origin != self.expected_origin {
            debug!(origin = %message.origin, "Ignoring message from unexpected origin");
            return None;
        }
        let parsed: CallbackMessage = match serde_json::from_value(message.body.clone()) {
            Ok(parsed) => parsed,
            Err(_) => {
                debug!("Ignoring message that is not a sign-in message");
                return None;
            }
        };

        let state_ok = match (&parsed, parsed.state()) {
            (_, Some(state)) => state == self.state,
            (CallbackMessage::SignInError { .. }, None) => true,
            (CallbackMessage::SignInSuccess { .. }, None) => false,
        };
        if !state_ok {
            debug!("Ignoring sign-in message for another attempt");
            return None;
        }
        Some(parsed)
    }
}
