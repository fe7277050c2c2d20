use std::time::Duration;

use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use super::message::{CallbackMessage, MessageBus, MessageFilter, WindowMessage};
use super::{RawAssertion, SignInTransport, TransportOutcome};
use crate::error::Error;
use crate::provider::ProviderConfig;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Opens provider-controlled popup windows.
pub trait PopupLauncher: Send + Sync + 'static {
    /// Open a popup at `url`.
    fn open(&self, url: &Url) -> Result<Box<dyn PopupWindow>, Error>;
}

/// Handle on an open popup.
pub trait PopupWindow: Send + Sync {
    /// `true` once the window is gone, whoever closed it.
    fn is_closed(&self) -> bool;

    fn close(&mut self);
}

/// Lifecycle of a popup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupState {
    Idle,
    Opened,
    Completed,
    Failed,
    Cancelled,
}

/// Sign-in through a popup that reports back over the [`MessageBus`].
///
/// One instance runs one attempt: after a terminal state, `begin` fails.
pub struct PopupTransport<L> {
    provider: ProviderConfig,
    launcher: L,
    bus: MessageBus,
    expected_origin: String,
    poll_interval: Duration,
    timeout: Option<Duration>,
    state: PopupState,
    nonce: Option<String>,
}

impl<L: PopupLauncher> PopupTransport<L> {
    /// Messages are accepted only from the origin of the provider's
    /// redirect URI; override with [`with_expected_origin`](Self::with_expected_origin).
    #[must_use]
    pub fn new(provider: ProviderConfig, launcher: L, bus: MessageBus) -> Self {
        let expected_origin = provider.callback_origin();
        Self {
            provider,
            launcher,
            bus,
            expected_origin,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            state: PopupState::Idle,
            nonce: None,
        }
    }

    #[must_use]
    pub fn with_expected_origin(mut self, origin: impl Into<String>) -> Self {
        self.expected_origin = origin.into();
        self
    }

    /// How often to check whether the user closed the popup (default 500 ms,
    /// at least 1 ms).
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Give up (as cancelled) after `timeout`. No timeout by default.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn state(&self) -> PopupState {
        self.state
    }

    /// Raw nonce of the current attempt, set once `begin` has built the
    /// authorization request.
    #[must_use]
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }
}

/// The window of a running attempt. Dropping it closes the window, and an
/// attempt still `Opened` at that point is recorded as cancelled.
struct OpenPopup<'a> {
    window: Box<dyn PopupWindow>,
    state: &'a mut PopupState,
}

impl OpenPopup<'_> {
    fn finish(mut self, outcome: &TransportOutcome) {
        *self.state = match outcome {
            TransportOutcome::Success(_) => PopupState::Completed,
            TransportOutcome::Failed(reason) => {
                warn!(reason = %reason, "Sign-in popup reported failure");
                PopupState::Failed
            }
            TransportOutcome::Cancelled => {
                info!("Sign-in popup cancelled");
                PopupState::Cancelled
            }
        };
    }
}

impl Drop for OpenPopup<'_> {
    fn drop(&mut self) {
        self.window.close();
        if *self.state == PopupState::Opened {
            debug!("Sign-in attempt abandoned");
            *self.state = PopupState::Cancelled;
        }
    }
}

impl<L: PopupLauncher> SignInTransport for PopupTransport<L> {
    async fn begin(&mut self) -> TransportOutcome {
        if self.state != PopupState::Idle {
            return TransportOutcome::Failed("sign-in attempt already started".into());
        }

        let request = self.provider.authorization_request();
        let filter = MessageFilter::new(self.expected_origin.clone(), request.state);
        self.nonce = Some(request.nonce);

        // Listen before the popup exists: it may post as soon as it loads.
        let mut messages = self.bus.subscribe();

        let window = match self.launcher.open(&request.url) {
            Ok(window) => window,
            Err(e) => {
                warn!(error = %e, "Failed to open sign-in popup");
                self.state = PopupState::Failed;
                return TransportOutcome::Failed(e.to_string());
            }
        };
        self.state = PopupState::Opened;
        info!("Sign-in popup opened");

        let (poll_interval, timeout) = (self.poll_interval, self.timeout);
        let popup = OpenPopup {
            window,
            state: &mut self.state,
        };
        let outcome = wait(&mut messages, &filter, &*popup.window, poll_interval, timeout).await;
        popup.finish(&outcome);
        outcome
    }

    fn nonce(&self) -> Option<&str> {
        PopupTransport::nonce(self)
    }
}

async fn wait(
    messages: &mut Receiver<WindowMessage>,
    filter: &MessageFilter,
    window: &dyn PopupWindow,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> TransportOutcome {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let deadline = async move {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            received = messages.recv() => match received {
                Ok(message) => {
                    if let Some(outcome) = outcome_for(filter, &message) {
                        return outcome;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Sign-in listener lagged behind the message channel");
                }
                Err(RecvError::Closed) => {
                    return TransportOutcome::Failed("message channel closed".into());
                }
            },

            _ = ticker.tick() => {
                if window.is_closed() {
                    // The popup may have posted right before closing itself.
                    return drain(messages, filter).unwrap_or(TransportOutcome::Cancelled);
                }
            },

            () = &mut deadline => {
                debug!("Sign-in popup timed out");
                return TransportOutcome::Cancelled;
            }
        }
    }
}

fn outcome_for(filter: &MessageFilter, message: &WindowMessage) -> Option<TransportOutcome> {
    match filter.accept(message)? {
        CallbackMessage::SignInSuccess { data, .. } => {
            Some(TransportOutcome::Success(RawAssertion(data)))
        }
        CallbackMessage::SignInError { error, .. } => Some(TransportOutcome::Failed(error)),
    }
}

fn drain(messages: &mut Receiver<WindowMessage>, filter: &MessageFilter) -> Option<TransportOutcome> {
    loop {
        match messages.try_recv() {
            Ok(message) => {
                if let Some(outcome) = outcome_for(filter, &message) {
                    return Some(outcome);
                }
            }
            Err(TryRecvError::Lagged(_)) => {}
            Err(_) => return None,
        }
    }
}
