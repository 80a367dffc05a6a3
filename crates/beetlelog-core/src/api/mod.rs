//! REST API client module for the beetlelog service.
//!
//! This module provides the `ApiClient` for observations, species
//! predictions, reports and account management.
//!
//! Requests carry a JWT bearer token from the `SessionStore`. The
//! `RequestInterceptor` refreshes an expired token once and re-sends the
//! request, so call sites never see a recoverable 401.

pub mod client;
pub mod error;
pub mod interceptor;
pub mod request;
pub mod transport;

pub use client::ApiClient;
pub use error::ApiError;
pub use interceptor::RequestInterceptor;
pub use request::{ApiRequest, ApiResponse, FormPart, RequestBody};
pub use transport::{HttpTransport, Transport};
