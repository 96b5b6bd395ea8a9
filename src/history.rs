use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    executor::{CapturedResponse, ResolvedRequest},
    method::Method,
};

/// Post-execution summary appended to a request's history.
#[derive(Serialize, Deserialize, Clone)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub struct NewHistoryEntry {
    pub request_id: String,
    pub method: Method,
    pub url: String,
    pub status: u16,
    pub response_time: u64,
    pub response_body: String,
    #[serde(default)]
    pub response_headers: IndexMap<String, String>,
}

impl NewHistoryEntry {
    pub fn from_execution(
        request_id: &str,
        request: &ResolvedRequest,
        response: &CapturedResponse,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            method: request.method,
            url: request.url.clone(),
            status: response.status,
            response_time: response.elapsed_ms,
            response_body: response.body.to_string(),
            response_headers: response.headers.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub struct HistoryEntry {
    pub id: String,
    #[serde(flatten)]
    pub entry: NewHistoryEntry,
    pub created_at: DateTime<Utc>,
}
