use super::race::{GuardStats, TimeoutGuard};
use crate::core::{NetError, Result};
use crate::ledger::CallMeta;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Description of one outbound HTTP-like call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Overrides the guard's default deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RequestOptions {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: method.to_ascii_uppercase(),
            headers: Vec::new(),
            body: None,
            timeout_ms: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: &str, body: serde_json::Value) -> Self {
        Self::new("POST", url).body(body)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn meta(&self) -> CallMeta {
        CallMeta::new(self.url.clone(), self.method.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub body: serde_json::Value,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The application's networking primitive.
#[async_trait]
pub trait HttpRequester: Send + Sync + 'static {
    async fn request(&self, options: RequestOptions) -> Result<Response>;
}

/// [`HttpRequester`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestRequester {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl ReqwestRequester {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative request URLs against `base_url`.
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: Some(base_url.trim_end_matches('/').to_string()),
        }
    }

    fn resolve(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if !url.contains("://") => {
                format!("{}/{}", base, url.trim_start_matches('/'))
            }
            _ => url.to_string(),
        }
    }
}

#[async_trait]
impl HttpRequester for ReqwestRequester {
    async fn request(&self, options: RequestOptions) -> Result<Response> {
        let method = reqwest::Method::from_bytes(options.method.as_bytes())
            .map_err(|_| NetError::Call(format!("invalid HTTP method '{}'", options.method)))?;

        let mut builder = self.client.request(method, self.resolve(&options.url));
        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };

        Ok(Response { status, body })
    }
}

/// Safe-request façade: every request goes through the timeout guard.
pub struct SafeRequest<R: HttpRequester> {
    requester: Arc<R>,
    guard: Arc<TimeoutGuard>,
}

impl<R: HttpRequester> Clone for SafeRequest<R> {
    fn clone(&self) -> Self {
        Self {
            requester: Arc::clone(&self.requester),
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<R: HttpRequester> SafeRequest<R> {
    pub fn new(requester: R, guard: Arc<TimeoutGuard>) -> Self {
        Self {
            requester: Arc::new(requester),
            guard,
        }
    }

    pub async fn request(&self, options: RequestOptions) -> Result<Response> {
        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.guard.default_timeout());
        let meta = options.meta();
        let requester = Arc::clone(&self.requester);

        self.guard
            .guard_with(
                move || async move { requester.request(options).await },
                timeout,
                meta,
            )
            .await
    }

    pub fn stats(&self) -> GuardStats {
        self.guard.stats()
    }

    pub fn force_close_all(&self) -> usize {
        self.guard.force_close_all()
    }

    pub fn guard(&self) -> &Arc<TimeoutGuard> {
        &self.guard
    }
}
