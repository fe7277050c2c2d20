#![doc = include_str!("../README.md")]

#[cfg(feature = "callback-server")]
pub mod callback;
pub mod config;
pub mod error;
pub mod gateway;
pub mod nonce;
pub mod orchestrator;
pub mod provider;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports for convenient access
pub use config::ClientConfig;
pub use error::Error;
pub use gateway::AuthGateway;
pub use orchestrator::AuthOrchestrator;
pub use provider::{AuthorizationRequest, ProviderConfig};
pub use store::{FileStorage, MemoryStorage, PendingSignIn, SessionStore, StorageBackend};
pub use transport::{
    MessageBus, PopupTransport, RawAssertion, RedirectTransport, SignInTransport, Transport,
    TransportOutcome,
};
pub use types::{
    AccessToken, IdentityAssertion, ProfileHint, Session, SessionEvent, UserId, UserProfile,
};
