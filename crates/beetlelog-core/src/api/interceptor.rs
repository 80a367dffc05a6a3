//! Bearer-token attachment and one-shot refresh-and-retry for API calls.

use std::sync::Arc;

use tracing::{debug, warn};

use super::request::{ApiRequest, ApiResponse, RetryableRequest};
use super::transport::Transport;
use super::ApiError;
use crate::auth::SessionStore;

/// Makes the token lifecycle invisible to call sites.
///
/// Every request carries the current access token. A 401 triggers one
/// coordinated refresh and one re-send of the same request; a second 401
/// is returned to the caller. Tokens are only ever changed through the
/// session store.
pub struct RequestInterceptor {
    transport: Arc<dyn Transport>,
    session: Arc<SessionStore>,
}

impl RequestInterceptor {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<SessionStore>) -> Self {
        Self { transport, session }
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    /// Send a request, refreshing the session and retrying once on a 401
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut call = RetryableRequest::new(request, self.session.access_token());
        loop {
            let response = self
                .transport
                .send(&call.request, call.sent_with.as_deref())
                .await?;
            if !response.is_auth_failure() {
                return response.error_for_status();
            }
            if call.already_retried {
                warn!(
                    method = %call.request.method,
                    path = %call.request.path,
                    "Request still unauthorized after token refresh"
                );
                return Err(response.into_error());
            }

            match self.fresh_token(call.sent_with.as_deref()).await {
                Some(token) => {
                    debug!(path = %call.request.path, "Retrying request with refreshed token");
                    call = call.retry_with(token);
                }
                None => {
                    debug!(path = %call.request.path, "No token after refresh; giving up");
                    return Err(response.into_error());
                }
            }
        }
    }

    /// A token to retry with: the session's current one if a refresh already
    /// replaced the rejected token, otherwise the outcome of a shared refresh.
    async fn fresh_token(&self, rejected: Option<&str>) -> Option<String> {
        if let Some(current) = self.session.access_token() {
            if rejected != Some(current.as_str()) {
                debug!("Access token changed while request was in flight");
                return Some(current);
            }
        }
        self.session.coordinated_refresh().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::store::tests::{store_with, FakeExchange};
    use crate::storage::{DurableStore, MemoryStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::Mutex;
    use std::time::Duration;

    /// API server double: accepts only the tokens in `valid`, records every attempt
    pub struct FakeApi {
        valid: Mutex<Vec<String>>,
        attempts: Mutex<Vec<(ApiRequest, Option<String>)>>,
        responses: Mutex<Vec<(String, ApiResponse)>>,
        delay: Duration,
    }

    impl FakeApi {
        pub fn accepting(tokens: &[&str]) -> Self {
            Self {
                valid: Mutex::new(tokens.iter().map(|t| t.to_string()).collect()),
                attempts: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Serve a canned response for a path once authorized
        pub fn respond(self, path: &str, status: StatusCode, body: &str) -> Self {
            self.responses
                .lock()
                .unwrap()
                .push((path.to_string(), ApiResponse::new(status, body)));
            self
        }

        pub fn tokens_seen(&self) -> Vec<Option<String>> {
            self.attempts.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }

        pub fn requests(&self) -> Vec<ApiRequest> {
            self.attempts.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for FakeApi {
        async fn send(
            &self,
            request: &ApiRequest,
            bearer: Option<&str>,
        ) -> Result<ApiResponse, ApiError> {
            self.attempts
                .lock()
                .unwrap()
                .push((request.clone(), bearer.map(str::to_string)));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let authorized = bearer
                .map(|t| self.valid.lock().unwrap().iter().any(|v| v == t))
                .unwrap_or(false);
            if !authorized {
                return Ok(ApiResponse::new(
                    StatusCode::UNAUTHORIZED,
                    r#"{"detail":"Given token not valid for any token type"}"#,
                ));
            }
            let canned = self
                .responses
                .lock()
                .unwrap()
                .iter()
                .find(|(path, _)| *path == request.path)
                .map(|(_, response)| response.clone());
            Ok(canned.unwrap_or_else(|| ApiResponse::new(StatusCode::OK, r#"{"ok": true}"#)))
        }
    }

    async fn logged_in(
        exchange: Arc<FakeExchange>,
        api: Arc<FakeApi>,
    ) -> (RequestInterceptor, Arc<MemoryStore>) {
        let storage = Arc::new(MemoryStore::new());
        let session = store_with(exchange, storage.clone());
        assert!(session.login("alice", "correct").await);
        (RequestInterceptor::new(api, session), storage)
    }

    #[tokio::test]
    async fn test_attaches_current_token() {
        let api = Arc::new(FakeApi::accepting(&["A1"]));
        let (interceptor, _) = logged_in(Arc::new(FakeExchange::new()), Arc::clone(&api)).await;

        interceptor.execute(ApiRequest::get("observations/")).await.unwrap();
        assert_eq!(api.tokens_seen(), vec![Some("A1".to_string())]);
    }

    #[tokio::test]
    async fn test_sends_unauthenticated_without_session() {
        let api = Arc::new(FakeApi::accepting(&["A1"]));
        let exchange = Arc::new(FakeExchange::new());
        let session = store_with(Arc::clone(&exchange), Arc::new(MemoryStore::new()));
        let interceptor = RequestInterceptor::new(api.clone(), session);

        let err = interceptor
            .execute(ApiRequest::get("observations/"))
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(api.tokens_seen(), vec![None]);
        assert_eq!(exchange.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_refreshes_and_retries_once_on_401() {
        let api = Arc::new(FakeApi::accepting(&["A2"]));
        let exchange = Arc::new(FakeExchange::new());
        let (interceptor, storage) = logged_in(Arc::clone(&exchange), Arc::clone(&api)).await;

        interceptor.execute(ApiRequest::get("observations/")).await.unwrap();

        assert_eq!(exchange.refreshes(), 1);
        assert_eq!(
            api.tokens_seen(),
            vec![Some("A1".to_string()), Some("A2".to_string())]
        );
        assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("A2"));
    }

    #[tokio::test]
    async fn test_second_401_is_not_retried_again() {
        // The server accepts neither the old nor the refreshed token
        let api = Arc::new(FakeApi::accepting(&[]));
        let exchange = Arc::new(FakeExchange::new());
        let (interceptor, _) = logged_in(Arc::clone(&exchange), Arc::clone(&api)).await;

        let err = interceptor
            .execute(ApiRequest::get("observations/"))
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(exchange.refreshes(), 1);
        assert_eq!(api.tokens_seen().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_propagates_401_and_logs_out() {
        let api = Arc::new(FakeApi::accepting(&["A2"]));
        let exchange = Arc::new(FakeExchange::new());
        let (interceptor, storage) = logged_in(Arc::clone(&exchange), Arc::clone(&api)).await;
        exchange.revoke_refresh();

        let err = interceptor
            .execute(ApiRequest::get("observations/"))
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(api.tokens_seen().len(), 1);
        assert!(!interceptor.session().is_authenticated());
        assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert_eq!(storage.get(REFRESH_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through() {
        let api = Arc::new(
            FakeApi::accepting(&["A1"]).respond(
                "observations/99/",
                StatusCode::NOT_FOUND,
                r#"{"detail":"Not found."}"#,
            ),
        );
        let exchange = Arc::new(FakeExchange::new());
        let (interceptor, _) = logged_in(Arc::clone(&exchange), Arc::clone(&api)).await;

        let err = interceptor
            .execute(ApiRequest::get("observations/99/"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::NotFound(ref m) if m == "Not found."));
        assert_eq!(exchange.refreshes(), 0);
        assert_eq!(api.tokens_seen().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let api = Arc::new(FakeApi::accepting(&["A2"]).with_delay(Duration::from_millis(10)));
        let exchange = Arc::new(FakeExchange::new().slow_refresh(Duration::from_millis(30)));
        let (interceptor, _) = logged_in(Arc::clone(&exchange), Arc::clone(&api)).await;

        let calls = (0..3).map(|i| interceptor.execute(ApiRequest::get(format!("observations/{}/", i))));
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(exchange.refreshes(), 1);
        let retried: Vec<_> = api
            .tokens_seen()
            .into_iter()
            .filter(|t| t.as_deref() != Some("A1"))
            .collect();
        assert_eq!(retried, vec![Some("A2".to_string()); 3]);
    }

    #[tokio::test]
    async fn test_late_401_uses_already_refreshed_token() {
        let api = Arc::new(FakeApi::accepting(&["A2"]));
        let exchange = Arc::new(FakeExchange::new());
        let (interceptor, _) = logged_in(Arc::clone(&exchange), Arc::clone(&api)).await;

        // A refresh completed after this request went out with A1
        interceptor.session().refresh_access().await;
        let call = RetryableRequest::new(ApiRequest::get("observations/"), Some("A1".to_string()));
        let token = interceptor.fresh_token(call.sent_with.as_deref()).await;

        assert_eq!(token.as_deref(), Some("A2"));
        assert_eq!(exchange.refreshes(), 1);
    }
}
