use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CheckoutError;
use crate::psp::BackUrls;
use crate::retry::RetryPolicy;

pub const ACCESS_TOKEN_ENV: &str = "MERCADOPAGO_ACCESS_TOKEN";
pub const DEFAULT_API_BASE_URL: &str = "https://api.mercadopago.com/";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Non-secret settings persisted as JSON. The access token never lands here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_base_url: String,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
    pub sandbox: bool,
    pub idempotency_namespace: Option<String>,
    pub back_urls: BackUrls,
    pub notification_url: Option<String>,
    pub statement_descriptor: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry: RetryPolicy::default(),
            sandbox: true,
            idempotency_namespace: Some("agenda-doc".to_string()),
            back_urls: BackUrls::default(),
            notification_url: None,
            statement_descriptor: Some("AGENDA.DOC".to_string()),
        }
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agenda-checkout")
        .join("config.json")
}

/// Reads settings from `path`. A missing file yields the defaults; a present
/// but unreadable one is an error.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings from {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing settings in {}", path.display()))
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating settings directory {}", dir.display()))?;
    }
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).with_context(|| format!("writing settings to {}", path.display()))?;
    Ok(())
}

/// Immutable configuration of one payment client, built once at startup and
/// shared by every call made through that client.
#[derive(Clone)]
pub struct ClientConfig {
    access_token: String,
    pub timeout: Duration,
    pub idempotency_namespace: Option<String>,
    pub api_base_url: String,
    pub sandbox: bool,
    pub retry: RetryPolicy,
    pub back_urls: BackUrls,
    pub notification_url: Option<String>,
    pub statement_descriptor: Option<String>,
}

impl ClientConfig {
    /// Fails fast on a blank token or a zero timeout, before anything touches
    /// the network.
    pub fn new(
        access_token: impl Into<String>,
        timeout_ms: u64,
        idempotency_namespace: Option<String>,
    ) -> Result<Self, CheckoutError> {
        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(CheckoutError::Configuration("access token is empty".into()));
        }
        if timeout_ms == 0 {
            return Err(CheckoutError::Configuration("timeout must be positive".into()));
        }
        Ok(Self {
            access_token: access_token.trim().to_string(),
            timeout: Duration::from_millis(timeout_ms),
            idempotency_namespace: idempotency_namespace.filter(|ns| !ns.trim().is_empty()),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            sandbox: true,
            retry: RetryPolicy::default(),
            back_urls: BackUrls::default(),
            notification_url: None,
            statement_descriptor: None,
        })
    }

    /// Token from the environment, everything else from `settings`.
    pub fn from_env(settings: &AppConfig) -> Result<Self, CheckoutError> {
        let token = std::env::var(ACCESS_TOKEN_ENV).map_err(|_| {
            CheckoutError::Configuration(format!("{ACCESS_TOKEN_ENV} environment variable not set"))
        })?;
        Self::from_settings(token, settings)
    }

    pub fn from_settings(
        token: impl Into<String>,
        settings: &AppConfig,
    ) -> Result<Self, CheckoutError> {
        let namespace = settings.idempotency_namespace.clone();
        let mut config = Self::new(token, settings.timeout_ms, namespace)?;
        config.api_base_url = settings.api_base_url.clone();
        config.sandbox = settings.sandbox;
        config.retry = settings.retry;
        config.back_urls = settings.back_urls.clone();
        config.notification_url = settings.notification_url.clone();
        config.statement_descriptor = settings.statement_descriptor.clone();
        Ok(config)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Header value sent for an order's own key.
    pub fn scoped_idempotency_key(&self, order_key: &str) -> String {
        match &self.idempotency_namespace {
            Some(ns) => format!("{ns}:{order_key}"),
            None => order_key.to_string(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("access_token", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("idempotency_namespace", &self.idempotency_namespace)
            .field("api_base_url", &self.api_base_url)
            .field("sandbox", &self.sandbox)
            .field("retry", &self.retry)
            .finish()
    }
}
