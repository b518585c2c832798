//! fbx-core: client-side Freebox OS authentication
//!
//! This crate provides:
//! - App registration against the device (`AppRegistrar`)
//! - Challenge-response sessions opened from the resulting app_token
//! - An authenticated client that renews expired sessions transparently
//! - A pinned-CA HTTP transport behind the `Transport` trait

pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod registrar;
pub mod session;
pub mod tls;
pub mod transport;

pub use client::Freebox;
pub use config::Config;
pub use error::{Error, Result};
pub use identity::AppIdentity;
pub use protocol::{AppRegistration, AuthorizationStatus, Permissions, Session};
pub use registrar::{AppRegistrar, TrackId};
pub use session::{AUTH_HEADER, SessionManager};
pub use tls::TrustAnchor;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Transport, TransportError};

/// Fixed local endpoint of the device on its own network
pub const DEFAULT_LOCAL_URL: &str = "https://mafreebox.freebox.fr";
