use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{assertion::Test, method::Method};

/// A `{key, value, enabled}` row shared by headers, query params and
/// environment variables. Disabled rows are kept but never sent.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    /// Parsed as JSON before sending, falling back to the raw text.
    #[default]
    Json,
    Text,
}

impl BodyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyType::Json => "json",
            BodyType::Text => "text",
        }
    }
}

impl TryFrom<&str> for BodyType {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "json" => Ok(BodyType::Json),
            "text" => Ok(BodyType::Text),
            _ => Err(format!("unknown body type: {}", value)),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewCollection {
    pub name: String,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct RequestDefinition {
    pub id: String,
    pub collection_id: String,
    pub name: String,
    pub method: Method,
    pub url: String,
    pub headers: Vec<KeyValue>,
    pub params: Vec<KeyValue>,
    pub body: String,
    pub body_type: BodyType,
    pub tests: Vec<Test>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating or replacing a request definition.
#[derive(Deserialize, Debug, Clone)]
pub struct NewRequest {
    pub collection_id: String,
    #[serde(default = "default_request_name")]
    pub name: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub params: Vec<KeyValue>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default)]
    pub tests: Vec<Test>,
}

fn default_request_name() -> String {
    "New Request".to_string()
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestUpdate {
    #[serde(default = "default_request_name")]
    pub name: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub params: Vec<KeyValue>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default)]
    pub tests: Vec<Test>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub variables: Vec<KeyValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewEnvironment {
    pub name: String,
    #[serde(default)]
    pub variables: Vec<KeyValue>,
}
