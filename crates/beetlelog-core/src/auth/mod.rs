//! Authentication module for managing the client session.
//!
//! This module provides:
//! - `Session`: The access/refresh token pair held by one execution context
//! - `SessionStore`: Login, logout and refresh, with durable persistence and
//!   cross-context synchronization
//! - `RefreshCoordinator`: Single-flight refresh shared by concurrent callers
//! - `AuthExchange`: The login and refresh network calls
//!
//! Access tokens are short-lived; an expired one is replaced transparently
//! by the request interceptor through `SessionStore::coordinated_refresh`.

pub mod exchange;
pub mod refresh;
pub mod session;
pub mod store;

pub use exchange::{AuthError, AuthExchange, HttpAuthExchange};
pub use refresh::RefreshCoordinator;
pub use session::{RefreshGrant, Session, TokenPair};
pub use store::SessionStore;
