use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use reqwest::{header::HeaderMap, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{definition::BodyType, method::Method};

/// A request with every placeholder substituted and disabled rows removed.
#[derive(PartialEq, Debug, Clone)]
pub struct ResolvedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub body_type: BodyType,
}

/// The uniform outcome of one outbound call. Status `0` marks a transport
/// failure, in which case `body` holds the error text.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct CapturedResponse {
    pub status: u16,
    pub status_text: String,
    /// Lower-cased names; a repeated header keeps its last value.
    pub headers: IndexMap<String, String>,
    /// Parsed JSON when the payload is JSON, otherwise the raw text as a string.
    pub body: Value,
    pub elapsed_ms: u64,
    pub size: usize,
}

pub const TRANSPORT_ERROR_STATUS_TEXT: &str = "Error";

impl CapturedResponse {
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self {
            status: 0,
            status_text: TRANSPORT_ERROR_STATUS_TEXT.to_string(),
            headers: IndexMap::new(),
            body: Value::String(message.into()),
            elapsed_ms: 0,
            size: 0,
        }
    }

    pub fn is_transport_error(&self) -> bool {
        self.status == 0
    }

    /// Canonical text of the body: raw text as-is, structured bodies as
    /// compact JSON.
    pub fn body_text(&self) -> String {
        body_text(&self.body)
    }
}

fn body_text(body: &Value) -> String {
    match body {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub struct Executor {
    client: Client,
}

impl Executor {
    /// `timeout` bounds the whole exchange; `None` waits indefinitely.
    pub fn new(timeout: Option<Duration>) -> Result<Self, String> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| format!("cannot build http client: {}", err))?;
        Ok(Self { client })
    }

    /// Issues the call. Every HTTP status is a completed call; transport
    /// failures come back as a status `0` response rather than an error.
    pub async fn execute(&self, request: &ResolvedRequest) -> CapturedResponse {
        let mut builder = self
            .client
            .request(request.method.into(), request.url.as_str());

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if request.method.has_body() {
            builder = match (request.body_type, request.body.as_deref()) {
                (BodyType::Json, raw) => {
                    let raw = raw.unwrap_or("{}");
                    match serde_json::from_str::<Value>(raw) {
                        Ok(value) => builder.json(&value),
                        Err(err) => {
                            debug!(url = %request.url, "sending unparsable json body as raw text: {}", err);
                            builder.body(raw.to_string())
                        }
                    }
                }
                (BodyType::Text, Some(raw)) => builder.body(raw.to_string()),
                (BodyType::Text, None) => builder,
            };
        }

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                let message = describe(&err);
                warn!(method = %request.method, url = %request.url, "request failed: {}", message);
                return CapturedResponse::transport_error(message);
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let status = response.status();
        let headers = collect_headers(response.headers());

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                let message = describe(&err);
                warn!(method = %request.method, url = %request.url, "reading body failed: {}", message);
                return CapturedResponse::transport_error(message);
            }
        };

        let body = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        let size = body_text(&body).len();

        debug!(
            method = %request.method,
            url = %request.url,
            status = status.as_u16(),
            elapsed_ms,
            size,
            "request completed"
        );

        CapturedResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            elapsed_ms,
            size,
        }
    }
}

fn collect_headers(headers: &HeaderMap) -> IndexMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Error, Debug, PartialEq)]
pub enum ExecuteError {
    #[error("request \"{0}\" is already executing")]
    AlreadyRunning(String),
}

/// Tracks request definitions with an outstanding execution so that an
/// overlapping execute for the same id is rejected.
#[derive(Default, Clone)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    pub fn begin(&self, request_id: &str) -> Result<InFlightGuard, ExecuteError> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(request_id.to_string()) {
            return Err(ExecuteError::AlreadyRunning(request_id.to_string()));
        }
        Ok(InFlightGuard {
            ids: Arc::clone(&self.ids),
            request_id: request_id.to_string(),
        })
    }

    pub fn is_running(&self, request_id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(request_id)
    }
}

/// Releases the request id when dropped.
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    request_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.request_id);
    }
}
