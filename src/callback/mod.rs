//! Loopback callback route for native applications.
//!
//! Serves the redirect return address. When the sign-in was started by a
//! [`PopupTransport`](crate::transport::PopupTransport) in this process, the
//! route forwards the provider's parameters over the shared
//! [`MessageBus`](crate::transport::MessageBus) and tells the browser tab it
//! can close. Otherwise it redirects to the entry route, carrying the
//! parameters for a [`RedirectTransport`](crate::transport::RedirectTransport)
//! to resume from.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use signin_session::callback::{CallbackConfig, callback_routes};
//!
//! let bus = MessageBus::new();
//! let app = axum::Router::new()
//!     .merge(callback_routes(CallbackConfig::new(&provider).with_opener(bus.clone())));
//! ```

mod routes;

pub use routes::{CallbackConfig, callback_routes};
