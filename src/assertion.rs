use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::executor::CapturedResponse;

/// A user-defined check stored on a request definition.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Test {
    pub id: String,
    #[serde(flatten)]
    pub check: Check,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// Expected values are kept as the user typed them and parsed at
/// evaluation time, so a bad value fails only its own test. Missing fields
/// and unknown types are accepted here for the same reason.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Check {
    Status {
        #[serde(default, deserialize_with = "expected_text")]
        value: String,
    },
    #[serde(alias = "header")]
    HeaderExists {
        #[serde(default)]
        field: String,
    },
    #[serde(alias = "body")]
    BodyContains {
        #[serde(default, deserialize_with = "expected_text")]
        value: String,
    },
    #[serde(alias = "json")]
    JsonPath {
        #[serde(default)]
        field: String,
        #[serde(default, deserialize_with = "expected_text")]
        value: String,
    },
    #[serde(alias = "time")]
    ResponseTime {
        #[serde(default, deserialize_with = "expected_text")]
        value: String,
    },
    #[serde(other)]
    Unsupported,
}

fn expected_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Error, PartialEq, Debug)]
pub enum AssertionError {
    #[error("expected value \"{0}\" is not a number")]
    NotANumber(String),
    #[error("path \"{0}\" does not exist in the response body")]
    PathNotFound(String),
    #[error("{0} check needs a field")]
    MissingField(&'static str),
    #[error("unsupported test type")]
    UnsupportedType,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct TestResult {
    pub test_id: String,
    pub passed: bool,
    pub message: String,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct Summary {
    pub passed: usize,
    pub total: usize,
}

impl Check {
    fn evaluate(&self, response: &CapturedResponse) -> Result<(bool, String), AssertionError> {
        match self {
            Check::Status { value } => {
                let expected: u16 = parse_number(value)?;
                Ok(if response.status == expected {
                    (true, format!("Status is {}", expected))
                } else {
                    (
                        false,
                        format!("Expected {}, got {}", expected, response.status),
                    )
                })
            }
            Check::HeaderExists { field } => {
                let field = required_field(field, "headerExists")?;
                let found = response.headers.contains_key(&field.to_lowercase());
                Ok(if found {
                    (true, format!("Header '{}' exists", field))
                } else {
                    (false, format!("Header '{}' not found", field))
                })
            }
            Check::BodyContains { value } => {
                let found = response.body_text().contains(value.as_str());
                Ok(if found {
                    (true, format!("Body contains '{}'", value))
                } else {
                    (false, format!("Body does not contain '{}'", value))
                })
            }
            Check::JsonPath { field, value } => {
                let field = required_field(field, "jsonPath")?;
                let actual = leaf_text(lookup(&response.body, field)?);
                Ok(if &actual == value {
                    (true, format!("{} equals {}", field, value))
                } else {
                    (false, format!("Expected {}, got {}", value, actual))
                })
            }
            Check::ResponseTime { value } => {
                let max: u64 = parse_number(value)?;
                let elapsed = response.elapsed_ms;
                Ok(if elapsed <= max {
                    (
                        true,
                        format!("Response time ({}ms) is under {}ms", elapsed, max),
                    )
                } else {
                    (
                        false,
                        format!("Response time ({}ms) exceeds {}ms", elapsed, max),
                    )
                })
            }
            Check::Unsupported => Err(AssertionError::UnsupportedType),
        }
    }
}

fn required_field<'a>(field: &'a str, kind: &'static str) -> Result<&'a str, AssertionError> {
    match field.trim() {
        "" => Err(AssertionError::MissingField(kind)),
        _ => Ok(field),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, AssertionError> {
    value
        .trim()
        .parse()
        .map_err(|_| AssertionError::NotANumber(value.to_string()))
}

/// Walks a dot-separated key path through nested objects. Array indices
/// and wildcards are not supported.
fn lookup<'a>(body: &'a Value, path: &str) -> Result<&'a Value, AssertionError> {
    path.split('.').try_fold(body, |current, key| match current {
        Value::Object(map) => map
            .get(key)
            .ok_or_else(|| AssertionError::PathNotFound(path.to_string())),
        _ => Err(AssertionError::PathNotFound(path.to_string())),
    })
}

fn leaf_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl Test {
    pub fn evaluate(&self, response: &CapturedResponse) -> TestResult {
        let (passed, message) = match self.check.evaluate(response) {
            Ok(outcome) => outcome,
            Err(err) => (false, format!("Error: {}", err)),
        };
        TestResult {
            test_id: self.id.clone(),
            passed,
            message,
        }
    }
}

/// Evaluates every enabled test on its own; one failing or unevaluable test
/// never affects the others.
pub fn evaluate(tests: &[Test], response: &CapturedResponse) -> Vec<TestResult> {
    tests
        .iter()
        .filter(|test| test.enabled)
        .map(|test| test.evaluate(response))
        .collect()
}

pub fn summarize(results: &[TestResult]) -> Summary {
    Summary {
        passed: results.iter().filter(|result| result.passed).count(),
        total: results.len(),
    }
}
