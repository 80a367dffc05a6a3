//! API client for the beetlelog REST API.
//!
//! This module provides the `ApiClient` struct for observations, species
//! predictions, reports and account management. Every call goes through the
//! `RequestInterceptor`, so an expired access token is refreshed and the call
//! retried without the caller noticing.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use super::interceptor::RequestInterceptor;
use super::request::{ApiRequest, ApiResponse};
use super::transport::{HttpTransport, Transport};
use crate::auth::{HttpAuthExchange, SessionStore};
use crate::config::Config;
use crate::models::{
    Inference, ListParams, NewObservation, Observation, ObservationList, ObservationSummary,
    ObservationUpdate, PasswordResetConfirm, PasswordResetRequest, PhotoUpload, PredictPreview,
    Registration, SummaryFilters, ValidationAck,
};

/// API client for the observation service.
/// Clone is cheap - the interceptor and its session are shared.
#[derive(Clone)]
pub struct ApiClient {
    interceptor: Arc<RequestInterceptor>,
}

impl ApiClient {
    /// Wire up transport, token exchange, token storage and session from config.
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        // Both share one connection pool
        let exchange = HttpAuthExchange::with_client(client.clone(), &config.api_base_url);
        let transport = HttpTransport::with_client(client, &config.api_base_url);

        let storage = config.token_store()?;
        let session = SessionStore::init(Arc::new(exchange), storage, config.request_timeout());
        debug!(base_url = %config.api_base_url, storage = ?config.storage, "API client ready");

        Ok(Self::new(Arc::new(transport), session))
    }

    pub fn new(transport: Arc<dyn Transport>, session: Arc<SessionStore>) -> Self {
        Self {
            interceptor: Arc::new(RequestInterceptor::new(transport, session)),
        }
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        self.interceptor.session()
    }

    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let label = format!("{} {}", request.method, request.path);
        self.interceptor
            .execute(request)
            .await
            .with_context(|| format!("Request failed: {}", label))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let path = request.path.clone();
        let response = self.send(request).await?;
        response
            .json()
            .with_context(|| format!("Failed to parse response from {}", path))
    }

    // ===== Observations =====

    pub async fn list_observations(&self, params: &ListParams) -> Result<Vec<Observation>> {
        let request = ApiRequest::get("observations/")
            .query_opt("search", params.search.as_deref())
            .query_opt("ordering", params.ordering.as_deref())
            .query_opt("page", params.page);
        let list: ObservationList = self.fetch(request).await?;
        let observations = list.into_vec();
        debug!(count = observations.len(), "Fetched observations");
        Ok(observations)
    }

    pub async fn get_observation(&self, id: i64) -> Result<Observation> {
        self.fetch(ApiRequest::get(format!("observations/{}/", id)))
            .await
    }

    pub async fn create_observation(&self, observation: NewObservation) -> Result<Observation> {
        let request = ApiRequest::post("observations/").multipart(observation.into_parts());
        let created: Observation = self.fetch(request).await?;
        info!(id = created.id, "Observation created");
        Ok(created)
    }

    /// Patch an observation: multipart when a new photo is attached, JSON otherwise
    pub async fn update_observation(&self, id: i64, update: ObservationUpdate) -> Result<Observation> {
        let path = format!("observations/{}/", id);
        let request = if update.has_photo() {
            ApiRequest::patch(path).multipart(update.into_parts())
        } else {
            ApiRequest::patch(path).json(&update)?
        };
        self.fetch(request).await
    }

    pub async fn delete_observation(&self, id: i64) -> Result<()> {
        self.send(ApiRequest::delete(format!("observations/{}/", id)))
            .await?;
        info!(id, "Observation deleted");
        Ok(())
    }

    // ===== Predictions =====

    /// Run the classifier on a saved observation
    pub async fn classify_observation(&self, id: i64) -> Result<Inference> {
        self.fetch(ApiRequest::post(format!("observations/{}/classify/", id)))
            .await
    }

    /// Record whether a prediction was right
    pub async fn validate_inference(&self, inference_id: i64, is_correct: bool) -> Result<bool> {
        let request = ApiRequest::post(format!("inferences/{}/validate/", inference_id))
            .json(&json!({ "is_correct": is_correct }))?;
        let ack: ValidationAck = self.fetch(request).await?;
        Ok(ack.ok)
    }

    /// Classify an image before it is saved as an observation
    pub async fn predict_preview(&self, photo: PhotoUpload) -> Result<PredictPreview> {
        let request = ApiRequest::post("predict_preview/").multipart(vec![photo.into_part("image")]);
        self.fetch(request).await
    }

    // ===== Reports =====

    fn report_request(path: &str, filters: &SummaryFilters) -> ApiRequest {
        filters
            .query_pairs()
            .into_iter()
            .fold(ApiRequest::get(path), |request, (key, value)| request.query(key, value))
    }

    pub async fn observation_summary(&self, filters: &SummaryFilters) -> Result<ObservationSummary> {
        self.fetch(Self::report_request("reports/observations/summary/", filters))
            .await
    }

    /// CSV export bytes, as generated by the server
    pub async fn export_csv(&self, filters: &SummaryFilters) -> Result<Vec<u8>> {
        let response = self
            .send(Self::report_request("reports/observations/export/", filters))
            .await?;
        Ok(response.body)
    }

    /// PDF report bytes, as generated by the server
    pub async fn export_pdf(&self, filters: &SummaryFilters) -> Result<Vec<u8>> {
        let response = self
            .send(Self::report_request("reports/observations/export_pdf/", filters))
            .await?;
        Ok(response.body)
    }

    // ===== Account =====

    pub async fn register(&self, registration: &Registration) -> Result<()> {
        self.send(ApiRequest::post("auth/register/").json(registration)?)
            .await?;
        info!(username = %registration.username, "Account registered");
        Ok(())
    }

    pub async fn request_password_reset(&self, request: &PasswordResetRequest) -> Result<()> {
        self.send(ApiRequest::post("auth/password/reset/").json(request)?)
            .await?;
        Ok(())
    }

    pub async fn confirm_password_reset(&self, confirm: &PasswordResetConfirm) -> Result<()> {
        self.send(ApiRequest::post("auth/password/reset/confirm/").json(confirm)?)
            .await?;
        Ok(())
    }
}
