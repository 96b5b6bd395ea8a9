use std::{borrow::Cow, collections::HashMap};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::{
    definition::{BodyType, KeyValue, RequestDefinition},
    executor::ResolvedRequest,
    method::Method,
};

// A placeholder name is any brace-free run between `{{` and `}}`.
static PLACEHOLDER_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap());

/// Enabled variables keyed by name. When a key is defined more than once the
/// first enabled definition wins.
pub struct Variables<'a> {
    values: HashMap<&'a str, &'a str>,
}

impl<'a> Variables<'a> {
    pub fn new(variables: &'a [KeyValue]) -> Self {
        let mut values = HashMap::new();
        for variable in variables.iter().filter(|v| v.enabled) {
            values
                .entry(variable.key.as_str())
                .or_insert(variable.value.as_str());
        }
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.values.get(name).copied()
    }

    pub fn resolve<'t>(&self, template: &'t str) -> Cow<'t, str> {
        PLACEHOLDER_REGEX.replace_all(template, |caps: &Captures| match self.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
    }
}

/// Replaces every `{{name}}` in `template` with the first enabled variable
/// named `name`. Unknown placeholders are kept verbatim and substituted
/// values are never rescanned.
pub fn resolve(template: &str, variables: &[KeyValue]) -> String {
    Variables::new(variables).resolve(template).into_owned()
}

/// The parts of a request that take part in execution, before substitution.
pub struct RequestTemplate<'a> {
    pub method: Method,
    pub url: &'a str,
    pub headers: &'a [KeyValue],
    pub params: &'a [KeyValue],
    pub body: &'a str,
    pub body_type: BodyType,
}

impl<'a> From<&'a RequestDefinition> for RequestTemplate<'a> {
    fn from(def: &'a RequestDefinition) -> Self {
        Self {
            method: def.method,
            url: &def.url,
            headers: &def.headers,
            params: &def.params,
            body: &def.body,
            body_type: def.body_type,
        }
    }
}

/// Substitutes variables into the URL, headers, params and body, drops
/// disabled rows and appends the enabled params to the URL query string.
pub fn resolve_request(template: &RequestTemplate<'_>, variables: &[KeyValue]) -> ResolvedRequest {
    let vars = Variables::new(variables);

    let resolve_rows = |rows: &[KeyValue]| -> Vec<(String, String)> {
        rows.iter()
            .filter(|row| row.enabled && !row.key.trim().is_empty())
            .map(|row| {
                (
                    vars.resolve(&row.key).into_owned(),
                    vars.resolve(&row.value).into_owned(),
                )
            })
            .collect()
    };

    let headers = resolve_rows(template.headers);
    let params = resolve_rows(template.params);

    let mut url = vars.resolve(template.url).into_owned();
    if !params.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&query);
    }

    let body = if template.body.is_empty() {
        None
    } else {
        Some(vars.resolve(template.body).into_owned())
    };

    ResolvedRequest {
        method: template.method,
        url,
        headers,
        body,
        body_type: template.body_type,
    }
}
