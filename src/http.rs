//! HTTP record fetcher.
//!
//! [`NetworkFetcher`] turns a [`SyncRequest`] into one HTTP call against the
//! configured endpoint and classifies the outcome into the error taxonomy:
//! - Per-attempt timeout enforced around the whole exchange
//! - Automatic retry (default 2, after 1s and 3s) for Timeout / NetworkUnreachable
//! - HTTP status and decode failures returned immediately
//!
//! The wire exchange sits behind [`HttpTransport`] so the fetcher can be driven
//! by [`ReqwestTransport`] in production and by scripted transports in tests.

use std::future::Future;

use base64::Engine;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::config::{FetchConfig, HttpMethod};
use crate::error::{GeoSyncError, Result, SyncErrorKind};
use crate::types::{FetchResult, LocationSample, RemoteRecord, RequestId, SyncRequest, TriggerReason};

/// A transport-level HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

/// Failures below the HTTP layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
}

/// Sends one HTTP request.
pub trait HttpTransport: Send + Sync + 'static {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = std::result::Result<HttpResponse, TransportError>> + Send;
}

/// Production transport backed by a pooled reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(config.timeout()).pool_max_idle_per_host(2);
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        let client = builder.build().map_err(|e| GeoSyncError::HttpClient {
            message: format!("Failed to create HTTP client: {}", e),
        })?;
        Ok(Self { client })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Unreachable(e.to_string())
    }
}

impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify)?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Fetches the remote record for a sync request.
pub trait RecordFetcher: Send + Sync + 'static {
    /// Perform the fetch. Exactly one result per call.
    fn fetch(&self, request: SyncRequest) -> impl Future<Output = FetchResult> + Send;
}

/// Build a Basic auth header value for an API key.
pub fn basic_auth_header(api_key: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", api_key));
    format!("Basic {}", encoded)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostBody {
    request_id: RequestId,
    trigger: TriggerReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    accuracy: Option<f64>,
}

impl PostBody {
    fn new(request: &SyncRequest) -> Self {
        let sample: Option<&LocationSample> = request.sample.as_ref();
        Self {
            request_id: request.id,
            trigger: request.trigger_reason,
            lat: sample.map(|s| s.latitude),
            lon: sample.map(|s| s.longitude),
            accuracy: sample.and_then(LocationSample::accuracy),
        }
    }
}

/// HTTP implementation of [`RecordFetcher`].
pub struct NetworkFetcher<T: HttpTransport> {
    transport: T,
    config: FetchConfig,
    auth_header: Option<String>,
}

impl NetworkFetcher<ReqwestTransport> {
    /// Fetcher using the reqwest transport.
    pub fn from_config(config: FetchConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::new(transport, config))
    }
}

impl<T: HttpTransport> NetworkFetcher<T> {
    pub fn new(transport: T, config: FetchConfig) -> Self {
        let auth_header = config
            .auth_header
            .clone()
            .or_else(|| config.api_key.as_deref().map(basic_auth_header));
        Self {
            transport,
            config,
            auth_header,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// HTTP request for a sync request.
    pub fn build_request(&self, request: &SyncRequest) -> HttpRequest {
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        if let Some(auth) = &self.auth_header {
            headers.push(("Authorization".to_string(), auth.clone()));
        }

        let mut query = Vec::new();
        let mut body = None;
        match self.config.method {
            HttpMethod::Get => {
                if let Some(sample) = &request.sample {
                    query.push(("lat".to_string(), sample.latitude.to_string()));
                    query.push(("lon".to_string(), sample.longitude.to_string()));
                    if let Some(accuracy) = sample.accuracy() {
                        query.push(("accuracy".to_string(), accuracy.to_string()));
                    }
                }
            }
            HttpMethod::Post => {
                // Serializing plain numbers and enums cannot fail
                body = serde_json::to_vec(&PostBody::new(request)).ok();
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
            }
        }

        HttpRequest {
            method: self.config.method,
            url: self.config.endpoint(),
            query,
            headers,
            body,
        }
    }

    async fn attempt(&self, http_request: &HttpRequest) -> std::result::Result<RemoteRecord, SyncErrorKind> {
        let sent = tokio::time::timeout(self.config.timeout(), self.transport.send(http_request.clone())).await;
        let response = match sent {
            Err(_) | Ok(Err(TransportError::Timeout)) => return Err(SyncErrorKind::Timeout),
            Ok(Err(TransportError::Unreachable(reason))) => {
                debug!("[NetworkFetcher] Unreachable: {}", reason);
                return Err(SyncErrorKind::NetworkUnreachable);
            }
            Ok(Ok(response)) => response,
        };
        decode_response(&response)
    }
}

/// Classify a response: non-2xx is HttpStatus, an empty or malformed body is
/// DecodeFailure.
pub fn decode_response(response: &HttpResponse) -> std::result::Result<RemoteRecord, SyncErrorKind> {
    if !(200..300).contains(&response.status) {
        return Err(SyncErrorKind::HttpStatus(response.status));
    }
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Err(SyncErrorKind::DecodeFailure);
    }
    serde_json::from_slice::<RemoteRecord>(&response.body).map_err(|e| {
        debug!("[NetworkFetcher] Decode error: {}", e);
        SyncErrorKind::DecodeFailure
    })
}

impl<T: HttpTransport> RecordFetcher for NetworkFetcher<T> {
    async fn fetch(&self, request: SyncRequest) -> FetchResult {
        let http_request = self.build_request(&request);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.attempt(&http_request).await {
                Ok(record) => {
                    info!(
                        "[NetworkFetcher] {} ok: record {} after {} attempt(s)",
                        request.id, record.id, attempts
                    );
                    return FetchResult::success(request, record, attempts);
                }
                Err(kind) if kind.is_retryable() && attempts <= self.config.max_retries => {
                    let backoff = self.config.retry_delay(attempts);
                    warn!(
                        "[NetworkFetcher] {} failed: {}, retry {} after {:?}",
                        request.id, kind, attempts, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(kind) => {
                    warn!(
                        "[NetworkFetcher] {} failed: {} after {} attempt(s)",
                        request.id, kind, attempts
                    );
                    return FetchResult::failure(request, kind, attempts);
                }
            }
        }
    }
}
