use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::eventlog::DEFAULT_LOG_CAPACITY;

pub const DEFAULT_PLUGGY_BASE_URL: &str = "https://api.pluggy.ai";
pub const DEFAULT_SDK_URL: &str = "https://cdn.pluggy.ai/pluggy-connect/v2.9.2/pluggy-connect.js";
const MIN_CREDENTIAL_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration is invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Runtime configuration for the connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    pub event_log_capacity: usize,
    pub pluggy: PluggyConfig,
    pub sdk: SdkConfig,
    pub widget: WidgetConfig,
}

#[serde_as]
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluggyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: Url,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

/// How the browser brings the vendor script into the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectMode {
    /// Plain `<script src>` element.
    ScriptTag,
    /// Fetch the source and execute it from a blob URL (same-origin copies behind a strict CSP).
    FetchBlob,
}

impl InjectMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "script-tag" | "script" => Some(InjectMode::ScriptTag),
            "fetch-blob" | "blob" => Some(InjectMode::FetchBlob),
            _ => None,
        }
    }
}

/// Where the Pluggy Connect SDK comes from and how long we wait for it.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub url: String,
    pub mode: InjectMode,
    pub max_attempts: u32,
    pub poll_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub attempt_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_backoff: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub notice_hide_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetConfig {
    pub language: String,
    pub theme: String,
    pub include_sandbox: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: false,
            event_log_capacity: DEFAULT_LOG_CAPACITY,
            pluggy: PluggyConfig::default(),
            sdk: SdkConfig::default(),
            widget: WidgetConfig::default(),
        }
    }
}

impl Default for PluggyConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            base_url: Url::parse(DEFAULT_PLUGGY_BASE_URL).expect("default base url is valid"),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl std::fmt::Debug for PluggyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluggyConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SDK_URL.to_string(),
            mode: InjectMode::ScriptTag,
            max_attempts: 2,
            poll_attempts: 20,
            poll_interval: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(250),
            notice_hide_delay: Duration::from_secs(3),
        }
    }
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            language: "pt".to_string(),
            theme: "dark".to_string(),
            include_sandbox: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(Self::default(), |key| std::env::var(key).ok())
    }

    /// Read a TOML file and let environment variables override it.
    pub fn from_file_and_env(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let base: AppConfig =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_lookup(base, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        mut base: AppConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        if let Some(addr) = lookup("BIND_ADDR") {
            base.bind_addr = addr.parse().context("failed to parse BIND_ADDR")?;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = port.trim().parse().context("failed to parse PORT")?;
            base.bind_addr.set_port(port);
        }

        if let Some(v) = lookup("ENABLE_CORS") {
            base.enable_cors = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("EVENT_LOG_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
            base.event_log_capacity = v;
        }

        if let Some(v) = lookup("PLUGGY_CLIENT_ID") {
            base.pluggy.client_id = v.trim().to_string();
        }
        if let Some(v) = lookup("PLUGGY_CLIENT_SECRET") {
            base.pluggy.client_secret = v.trim().to_string();
        }
        if let Some(v) = lookup("PLUGGY_BASE_URL") {
            base.pluggy.base_url = Url::parse(&v).context("failed to parse PLUGGY_BASE_URL")?;
        }
        if let Some(v) = lookup("PLUGGY_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
        {
            base.pluggy.request_timeout = Duration::from_secs(v);
        }

        if let Some(v) = lookup("PLUGGY_SDK_URL") {
            base.sdk.url = v;
        }
        if let Some(mode) = lookup("PLUGGY_SDK_MODE").and_then(|v| InjectMode::parse(&v)) {
            base.sdk.mode = mode;
        }
        if let Some(v) = lookup("SDK_LOAD_ATTEMPTS").and_then(|v| v.parse::<u32>().ok()) {
            base.sdk.max_attempts = v;
        }
        if let Some(v) = lookup("SDK_POLL_ATTEMPTS").and_then(|v| v.parse::<u32>().ok()) {
            base.sdk.poll_attempts = v;
        }
        if let Some(d) = millis(&lookup, "SDK_POLL_INTERVAL_MS") {
            base.sdk.poll_interval = d;
        }
        if let Some(d) = millis(&lookup, "SDK_LOAD_TIMEOUT_MS") {
            base.sdk.attempt_timeout = d;
        }
        if let Some(d) = millis(&lookup, "SDK_RETRY_BACKOFF_MS") {
            base.sdk.retry_backoff = d;
        }
        if let Some(d) = millis(&lookup, "STATUS_NOTICE_MS") {
            base.sdk.notice_hide_delay = d;
        }

        if let Some(v) = lookup("WIDGET_LANGUAGE") {
            base.widget.language = v;
        }
        if let Some(v) = lookup("WIDGET_THEME") {
            base.widget.theme = v;
        }
        if let Some(v) = lookup("WIDGET_INCLUDE_SANDBOX") {
            base.widget.include_sandbox = v == "1" || v.eq_ignore_ascii_case("true");
        }

        Ok(base)
    }

    /// Collect every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = self.pluggy.problems();
        if self.sdk.max_attempts == 0 {
            problems.push("SDK_LOAD_ATTEMPTS must be at least 1".to_string());
        }
        if self.sdk.poll_attempts == 0 {
            problems.push("SDK_POLL_ATTEMPTS must be at least 1".to_string());
        }
        if self.sdk.url.trim().is_empty() {
            problems.push("PLUGGY_SDK_URL is empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

impl PluggyConfig {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, value) in [
            ("PLUGGY_CLIENT_ID", &self.client_id),
            ("PLUGGY_CLIENT_SECRET", &self.client_secret),
        ] {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                problems.push(format!("{name} is not set"));
            } else if trimmed.len() < MIN_CREDENTIAL_LEN {
                problems.push(format!("{name} looks invalid (too short)"));
            }
        }
        problems
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
