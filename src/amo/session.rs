use crate::http::build_client;
use crate::models::TokenPair;
use crate::store::{StoreError, TokenStore};
use reqwest::{Client, Method, Response};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("AmoCRM credentials are not configured")]
    MissingCredentials,
    #[error("AmoCRM tokens not found; set AMOCRM_AUTHORIZATION_CODE or seed the amo_tokens table")]
    TokensNotFound,
    #[error("AmoCRM authentication failed: {0}")]
    Unauthorized(String),
    #[error("AmoCRM request failed: {0}")]
    Request(String),
    #[error("invalid AmoCRM response: {0}")]
    Deserialize(String),
    #[error("token storage error: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct AmoConfig {
    pub subdomain: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_code: Option<String>,
}

impl AmoConfig {
    pub fn from_env() -> Result<Self, CrmError> {
        let subdomain = std::env::var("AMOCRM_SUBDOMAIN").unwrap_or_default();
        let client_id = std::env::var("AMOCRM_CLIENT_ID").unwrap_or_default();
        let client_secret = std::env::var("AMOCRM_CLIENT_SECRET").unwrap_or_default();
        let redirect_uri = std::env::var("AMOCRM_REDIRECT_URI").unwrap_or_default();
        let auth_code = std::env::var("AMOCRM_AUTHORIZATION_CODE")
            .ok()
            .filter(|code| !code.trim().is_empty());

        if subdomain.is_empty() || client_id.is_empty() || client_secret.is_empty() {
            return Err(CrmError::MissingCredentials);
        }

        Ok(Self {
            subdomain,
            client_id,
            client_secret,
            redirect_uri,
            auth_code,
        })
    }

    pub fn base_url(&self) -> String {
        format!("https://{}.amocrm.ru", self.subdomain)
    }
}

#[derive(Default)]
struct SessionState {
    loaded: bool,
    pair: Option<TokenPair>,
}

/// Owns the AmoCRM access/refresh token lifecycle: lazy load from the token
/// store, one-time code exchange, refresh-on-401 with a single retry, and
/// persist-on-change. Memory and storage are updated together under the
/// session lock, so no request observes them disagreeing.
pub struct AmoSession<T: TokenStore> {
    config: AmoConfig,
    store: Arc<T>,
    http: Client,
    state: Mutex<SessionState>,
}

impl<T: TokenStore> AmoSession<T> {
    pub fn new(config: AmoConfig, store: Arc<T>) -> Self {
        Self {
            config,
            store,
            http: build_client(),
            state: Mutex::new(SessionState::default()),
        }
    }

    #[allow(dead_code)]
    pub fn config(&self) -> &AmoConfig {
        &self.config
    }

    /// Performs an authorized call against the CRM. A 401 triggers exactly
    /// one reauthentication (refresh grant when a refresh token is held,
    /// else the configured authorization code) and one retry; a second
    /// failure propagates.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, CrmError> {
        let access = self.ensure_tokens().await?;
        let response = self.send(method.clone(), path, body, &access).await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let access = self.reauthorize().await?;
        let retry = self.send(method, path, body, &access).await?;
        if retry.status() == reqwest::StatusCode::UNAUTHORIZED {
            let detail = retry.text().await.unwrap_or_default();
            return Err(CrmError::Unauthorized(format!(
                "retry after token refresh still rejected: {detail}"
            )));
        }
        Ok(retry)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access: &str,
    ) -> Result<Response, CrmError> {
        let url = format!("{}{}", self.config.base_url(), path);
        let mut request = self.http.request(method, url).bearer_auth(access);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|err| CrmError::Request(err.to_string()))
    }

    /// Returns a usable access token, loading or establishing the pair on
    /// first use.
    pub async fn ensure_tokens(&self) -> Result<String, CrmError> {
        let mut state = self.state.lock().await;
        if let Some(pair) = &state.pair {
            return Ok(pair.access_token.clone());
        }

        if !state.loaded {
            state.loaded = true;
            if let Some(pair) = self.store.tokens().await? {
                let access = pair.access_token.clone();
                state.pair = Some(pair);
                return Ok(access);
            }
        }

        let Some(code) = self.config.auth_code.clone() else {
            return Err(CrmError::TokensNotFound);
        };
        let pair = self.exchange_code(&code).await?;
        self.store.save_tokens(&pair).await?;
        let access = pair.access_token.clone();
        state.pair = Some(pair);
        info!(target = "permit.amo", "tokens established via authorization code");
        Ok(access)
    }

    async fn reauthorize(&self) -> Result<String, CrmError> {
        let mut state = self.state.lock().await;
        let refresh_token = state.pair.as_ref().map(|pair| pair.refresh_token.clone());

        let pair = if let Some(refresh_token) = refresh_token.filter(|t| !t.is_empty()) {
            self.refresh(&refresh_token).await?
        } else if let Some(code) = self.config.auth_code.clone() {
            self.exchange_code(&code).await?
        } else {
            return Err(CrmError::Unauthorized(
                "token expired and no refresh token or authorization code is available".into(),
            ));
        };

        // Persist before the retry uses the new pair.
        self.store.save_tokens(&pair).await?;
        let access = pair.access_token.clone();
        state.pair = Some(pair);
        info!(target = "permit.amo", "tokens refreshed after 401");
        Ok(access)
    }

    /// One-time authorization-code grant. Does not persist; the session
    /// paths that need persistence save the pair themselves.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenPair, CrmError> {
        if code.trim().is_empty() {
            return Err(CrmError::Unauthorized("authorization code is empty".into()));
        }
        self.token_grant(json!({
            "client_id": self.config.client_id,
            "client_secret": self.config.client_secret,
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": self.config.redirect_uri,
        }))
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, CrmError> {
        self.token_grant(json!({
            "client_id": self.config.client_id,
            "client_secret": self.config.client_secret,
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "redirect_uri": self.config.redirect_uri,
        }))
        .await
    }

    /// Refresh and code exchange share the one token endpoint; only the
    /// grant parameters differ.
    async fn token_grant(&self, body: Value) -> Result<TokenPair, CrmError> {
        let url = format!("{}/oauth2/access_token", self.config.base_url());
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| CrmError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(CrmError::Unauthorized(format!(
                "token grant failed: HTTP {status}. {detail}"
            )));
        }

        response
            .json::<TokenPair>()
            .await
            .map_err(|err| CrmError::Deserialize(err.to_string()))
    }
}
