use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{Instrument, debug, info_span};

use crate::config::PluggyConfig;
use crate::error::{ApiFailure, ConnectError};
use crate::eventlog::EventLog;

const ANONYMOUS_PREFIX: &str = "anon-";

/// Short-lived credential for one Pluggy Connect session. Consumed by the widget
/// manager, so a token can never back two attempts.
pub struct ConnectToken {
    access_token: String,
    issued_at: DateTime<Utc>,
    user_id: Option<String>,
}

impl ConnectToken {
    pub fn new(access_token: String, user_id: Option<String>) -> Self {
        Self {
            access_token,
            issued_at: Utc::now(),
            user_id,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// First characters only; the full token never goes to logs.
    pub fn preview(&self) -> String {
        let head: String = self.access_token.chars().take(8).collect();
        format!("{head}...")
    }
}

impl std::fmt::Debug for ConnectToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectToken")
            .field("access_token", &self.preview())
            .field("issued_at", &self.issued_at)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Scoping identifier for the connect token: the normalized email when one was given,
/// otherwise a per-session id built from the current time.
pub fn derive_user_id(email: Option<&str>, now: DateTime<Utc>) -> String {
    match email.map(str::trim).filter(|e| !e.is_empty()) {
        Some(email) => email.to_lowercase(),
        None => format!("{ANONYMOUS_PREFIX}{}", now.timestamp_millis()),
    }
}

/// Client for the two Pluggy calls behind a connect token: `/auth` then `/connect_token`.
#[derive(Clone)]
pub struct PluggyClient {
    cfg: PluggyConfig,
    http: reqwest::Client,
    log: Arc<EventLog>,
}

impl PluggyClient {
    pub fn new(cfg: PluggyConfig, log: Arc<EventLog>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("financefly-connector/", env!("CARGO_PKG_VERSION")))
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self { cfg, http, log })
    }

    pub async fn authenticate(&self) -> Result<String, ConnectError> {
        self.log.info("Authenticating with Pluggy...");
        let body = json!({
            "clientId": self.cfg.client_id,
            "clientSecret": self.cfg.client_secret,
        });
        let result = self
            .post_json("auth", None, &body)
            .await
            .and_then(|resp| required_str(&resp, "apiKey"));
        match result {
            Ok(api_key) => {
                self.log.success("Pluggy authentication succeeded");
                Ok(api_key)
            }
            Err(failure) => {
                self.log
                    .error(format!("Pluggy authentication failed: {failure}"));
                Err(ConnectError::Auth(failure))
            }
        }
    }

    pub async fn request_connect_token(
        &self,
        api_key: &str,
        user_id: Option<&str>,
    ) -> Result<String, ConnectError> {
        let who = user_id.unwrap_or("anonymous");
        self.log
            .info(format!("Requesting connect token for {who}..."));
        let body = match user_id {
            Some(id) => json!({ "clientUserId": id }),
            None => json!({}),
        };
        let result = self
            .post_json("connect_token", Some(api_key), &body)
            .await
            .and_then(|resp| required_str(&resp, "accessToken"));
        match result {
            Ok(token) => {
                self.log.success(format!("Connect token issued for {who}"));
                Ok(token)
            }
            Err(failure) => {
                self.log
                    .error(format!("Connect token request failed: {failure}"));
                Err(ConnectError::Token(failure))
            }
        }
    }

    /// Authenticate, then request a token scoped to the identity derived from `email`.
    /// No retries: any failure ends the attempt.
    pub async fn acquire_token(&self, email: Option<&str>) -> Result<ConnectToken, ConnectError> {
        let user_id = derive_user_id(email, Utc::now());
        let span = info_span!("acquire_token", user = %user_id);
        async {
            let api_key = self.authenticate().await?;
            let access_token = self
                .request_connect_token(&api_key, Some(&user_id))
                .await?;
            let token = ConnectToken::new(access_token, Some(user_id.clone()));
            debug!(token = %token.preview(), "connect token ready");
            Ok::<_, ConnectError>(token)
        }
        .instrument(span)
        .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn post_json(
        &self,
        path: &str,
        api_key: Option<&str>,
        body: &Value,
    ) -> Result<Value, ApiFailure> {
        let url = self.endpoint(path);
        debug!(%url, "pluggy request");
        let mut request = self
            .http
            .post(&url)
            .header(http::header::ACCEPT, "application/json")
            .json(body);
        if let Some(key) = api_key {
            request = request.header("X-API-KEY", key);
        }
        let resp = request
            .send()
            .await
            .map_err(|err| ApiFailure::from_transport(&err))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| ApiFailure::from_transport(&err))?;
        debug!(%url, %status, len = bytes.len(), "pluggy response");
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            return Err(ApiFailure::from_status(status, text));
        }
        serde_json::from_slice(&bytes).map_err(|err| ApiFailure::Malformed(err.to_string()))
    }
}

fn required_str(resp: &Value, field: &'static str) -> Result<String, ApiFailure> {
    resp.get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiFailure::MissingField(field))
}
