//! OAuth token lifecycle for Make.com
//!
//! The token state sits behind an async mutex that is held across a refresh,
//! so concurrent callers needing a fresh token wait for the single refresh in
//! flight instead of starting their own.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::transport::{HttpRequest, Transport};
use crate::error::{Error, Result};

/// Tokens this close to expiry are refreshed before use
pub const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    fn usable(&self, now: DateTime<Utc>) -> Option<&str> {
        let token = self.access_token.as_deref()?;
        match self.expires_at {
            Some(expires) if expires - Duration::seconds(EXPIRY_SKEW_SECS) <= now => None,
            _ => Some(token),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct TokenManager {
    client_id: String,
    client_secret: String,
    token_url: String,
    state: Mutex<TokenState>,
    refreshes: AtomicU32,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("client_id", &self.client_id)
            .field("token_url", &self.token_url)
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}

impl TokenManager {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: impl Into<String>,
        access_token: Option<String>,
        refresh_token: Option<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: token_url.into(),
            state: Mutex::new(TokenState {
                access_token,
                refresh_token,
                // Pre-issued tokens carry no expiry; a 401 forces the first refresh
                expires_at: None,
            }),
            refreshes: AtomicU32::new(0),
        }
    }

    /// Number of refresh exchanges performed
    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.expires_at
    }

    /// A usable access token, refreshing first when missing or near expiry
    pub async fn access_token(&self, transport: &dyn Transport) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.usable(Utc::now()) {
            return Ok(token.to_string());
        }
        self.refresh_locked(&mut state, transport).await
    }

    /// Refresh after the platform rejected `rejected`.
    ///
    /// If another caller already replaced that token, the replacement is returned.
    pub async fn force_refresh(&self, transport: &dyn Transport, rejected: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(current) = state.access_token.as_deref() {
            if current != rejected && state.usable(Utc::now()).is_some() {
                return Ok(current.to_string());
            }
        }
        self.refresh_locked(&mut state, transport).await
    }

    /// Drop the cached access token; the refresh token is kept for reconnects
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.access_token = None;
        state.expires_at = None;
    }

    async fn refresh_locked(
        &self,
        state: &mut TokenState,
        transport: &dyn Transport,
    ) -> Result<String> {
        let Some(refresh_token) = state.refresh_token.clone() else {
            return Err(Error::Authentication(
                "access token expired and no refresh token is available".to_string(),
            ));
        };

        debug!(client_id = %self.client_id, "Refreshing OAuth access token");
        let request = HttpRequest::post(&self.token_url).form(vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token),
            ("client_id".to_string(), self.client_id.clone()),
            ("client_secret".to_string(), self.client_secret.clone()),
        ]);

        let response = transport
            .send(request)
            .await?
            .error_for_status()
            .map_err(|e| match e {
                Error::Authentication(msg) | Error::InvalidRequest(msg) => {
                    warn!(client_id = %self.client_id, "OAuth token refresh rejected");
                    Error::Authentication(format!("token refresh rejected: {}", msg))
                }
                other => other,
            })?;
        let tokens: TokenResponse = response.json()?;

        self.refreshes.fetch_add(1, Ordering::SeqCst);
        state.expires_at = tokens
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));
        if let Some(rotated) = tokens.refresh_token {
            state.refresh_token = Some(rotated);
        }
        state.access_token = Some(tokens.access_token.clone());

        info!(
            client_id = %self.client_id,
            expires_at = ?state.expires_at,
            "OAuth access token refreshed"
        );
        Ok(tokens.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::transport::{Body, HttpResponse};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    struct TokenEndpoint {
        calls: AtomicU32,
        status: u16,
    }

    #[async_trait]
    impl Transport for TokenEndpoint {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(matches!(request.body, Some(Body::Form(_))));
            tokio::task::yield_now().await;
            if self.status != 200 {
                return Ok(HttpResponse::new(self.status, r#"{"error":"invalid_grant"}"#));
            }
            Ok(HttpResponse::new(
                200,
                format!(
                    r#"{{"access_token":"access-{}","refresh_token":"refresh-{}","expires_in":3600}}"#,
                    n, n
                ),
            ))
        }
    }

    fn endpoint(status: u16) -> TokenEndpoint {
        TokenEndpoint {
            calls: AtomicU32::new(0),
            status,
        }
    }

    fn manager(access: Option<&str>, refresh: Option<&str>) -> TokenManager {
        TokenManager::new(
            "client",
            "secret",
            "https://make.test/oauth/v2/token",
            access.map(String::from),
            refresh.map(String::from),
        )
    }

    #[test]
    fn test_expiry_skew() {
        let now = Utc::now();
        let state = TokenState {
            access_token: Some("t".into()),
            refresh_token: None,
            expires_at: Some(now + Duration::seconds(30)),
        };
        assert!(state.usable(now).is_none());

        let state = TokenState {
            expires_at: Some(now + Duration::seconds(600)),
            ..state
        };
        assert_eq!(state.usable(now), Some("t"));
    }

    #[tokio::test]
    async fn test_preissued_token_used_without_refresh() {
        let transport = endpoint(200);
        let tokens = manager(Some("given"), Some("r"));
        assert_eq!(tokens.access_token(&transport).await.unwrap(), "given");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let transport = Arc::new(endpoint(200));
        let tokens = Arc::new(manager(None, Some("r0")));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let transport = transport.clone();
            let tokens = tokens.clone();
            handles.push(tokio::spawn(async move {
                tokens.access_token(transport.as_ref()).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "access-1");
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.refresh_count(), 1);
        assert!(tokens.expires_at().await.is_some());
    }

    #[tokio::test]
    async fn test_force_refresh_skips_when_already_rotated() {
        let transport = endpoint(200);
        let tokens = manager(Some("stale"), Some("r0"));

        assert_eq!(
            tokens.force_refresh(&transport, "stale").await.unwrap(),
            "access-1"
        );
        assert_eq!(
            tokens.force_refresh(&transport, "stale").await.unwrap(),
            "access-1"
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_authentication_error() {
        let transport = endpoint(400);
        let tokens = manager(None, Some("revoked"));
        let err = tokens.access_token(&transport).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert!(err.to_string().contains("Authentication failed"));
    }

    #[tokio::test]
    async fn test_missing_refresh_token() {
        let transport = endpoint(200);
        let tokens = manager(None, None);
        assert!(matches!(
            tokens.access_token(&transport).await,
            Err(Error::Authentication(_))
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }
}
