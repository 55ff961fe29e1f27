//! Coinbase Advanced Trade HTTP client
//!
//! A blocking client with:
//! - Retry with exponential backoff for transient failures
//! - Min-interval rate limiting
//! - Circuit breaker across the whole pass
//! - API key request signing

use reqwest::blocking::Client;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::thread::sleep;
use std::time::Duration;

use super::auth::Credentials;
use crate::common::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
use crate::config::ExchangeConfig;
use crate::exchange::{ExchangeError, ExchangeResult};

/// Base URL for the Coinbase REST API
pub const API_BASE_URL: &str = "https://api.coinbase.com";

/// Path prefix of every Advanced Trade endpoint
pub const BROKERAGE_PREFIX: &str = "/api/v3/brokerage";

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Retries after the first attempt for idempotent requests
    pub max_retries: u32,
    pub timeout: Duration,
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: API_BASE_URL.to_string(),
            max_retries: 3,
            timeout: Duration::from_secs(30),
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.rate_limiter = self.rate_limiter.with_min_interval(interval);
        self
    }

    pub fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker = self.circuit_breaker.with_failure_threshold(threshold);
        self
    }
}

impl From<&ExchangeConfig> for ClientConfig {
    fn from(cfg: &ExchangeConfig) -> Self {
        ClientConfig::default()
            .with_base_url(cfg.base_url.trim_end_matches('/'))
            .with_max_retries(cfg.max_retries)
            .with_timeout(cfg.timeout())
            .with_min_interval(cfg.min_request_interval())
            .with_circuit_breaker_threshold(cfg.circuit_breaker_threshold)
    }
}

/// Whether a failed request may be sent again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Reads and other requests with no side effect on repeat
    Idempotent,
    /// Order creation: a timeout may hide an accepted order
    Once,
}

pub struct CoinbaseClient {
    credentials: Credentials,
    http_client: Client,
    base_url: String,
    circuit_breaker: Mutex<CircuitBreaker>,
    rate_limiter: RateLimiter,
    max_retries: u32,
}

impl CoinbaseClient {
    pub fn new(credentials: Credentials, config: ClientConfig) -> ExchangeResult<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            credentials,
            http_client,
            base_url: config.base_url,
            circuit_breaker: Mutex::new(CircuitBreaker::new(config.circuit_breaker)),
            rate_limiter: RateLimiter::new(config.rate_limiter),
            max_retries: config.max_retries,
        })
    }

    /// Signed GET under the brokerage prefix
    pub fn get<R: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, String)]) -> ExchangeResult<R> {
        let text = self.execute_with_retry(RetryPolicy::Idempotent, || {
            self.send(Method::GET, endpoint, query, None)
        })?;
        parse_body(&text)
    }

    /// Signed POST with a JSON body under the brokerage prefix
    pub fn post<T, R>(&self, endpoint: &str, body: &T, policy: RetryPolicy) -> ExchangeResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let json_body =
            serde_json::to_string(body).map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let text = self.execute_with_retry(policy, || {
            self.send(Method::POST, endpoint, &[], Some(json_body.clone()))
        })?;
        parse_body(&text)
    }

    /// Run `operation` behind the circuit breaker and rate limiter, retrying
    /// retryable failures with exponential backoff (1s, 2s, 4s, ...)
    fn execute_with_retry<T, F>(&self, policy: RetryPolicy, operation: F) -> ExchangeResult<T>
    where
        F: Fn() -> ExchangeResult<T>,
    {
        if !self.breaker().can_attempt() {
            return Err(ExchangeError::CircuitOpen);
        }

        let max_retries = match policy {
            RetryPolicy::Idempotent => self.max_retries,
            RetryPolicy::Once => 0,
        };

        let mut last_error = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                tracing::debug!("Retrying after {}ms", delay.as_millis());
                sleep(delay);
            }

            self.rate_limiter.acquire();
            match operation() {
                Ok(result) => {
                    self.breaker().record_success();
                    return Ok(result);
                }
                Err(e) if !e.is_retryable() => {
                    // The exchange answered; the connection is healthy
                    self.breaker().record_success();
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}",
                        attempt + 1,
                        max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        self.breaker().record_failure();
        Err(last_error.unwrap_or_else(|| ExchangeError::Transport("request failed after retries".to_string())))
    }

    fn send(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<String>,
    ) -> ExchangeResult<String> {
        let path = format!("{}{}", BROKERAGE_PREFIX, endpoint);
        let url = format!("{}{}", self.base_url, path);
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let body_str = body.as_deref().unwrap_or("");
        let signature = self
            .credentials
            .sign(&timestamp, method.as_str(), &path, body_str);

        let mut request = self
            .http_client
            .request(method, &url)
            .header("CB-ACCESS-KEY", self.credentials.api_key())
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", &timestamp)
            .header("Accept", "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.header("Content-Type", "application/json").body(body);
        }

        let response = request.send()?;
        let status = response.status();
        let text = response.text()?;

        if !status.is_success() {
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                message: text,
            });
        }
        Ok(text)
    }

    fn breaker(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        self.circuit_breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_body<R: DeserializeOwned>(text: &str) -> ExchangeResult<R> {
    serde_json::from_str(text).map_err(|e| {
        let preview: String = text.chars().take(200).collect();
        ExchangeError::Parse(format!("{}: {}", e, preview))
    })
}
