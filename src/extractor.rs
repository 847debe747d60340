//! Variable extraction from HTTP responses.
//!
//! Extractors pull identifiers out of a reply (JSONPath, regex, header or
//! cookie) so later journey steps can reference them. They are compiled when
//! the plan is built; at request time extraction is a fallible accessor whose
//! failure the caller turns into a failed outcome.

use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::Value;
use serde_json_path::JsonPath;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during variable extraction.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("JSONPath query failed: {0}")]
    JsonPathError(String),

    #[error("Invalid JSON response: {0}")]
    InvalidJson(String),

    #[error("Regex compilation failed: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Regex pattern did not match")]
    RegexNoMatch,

    #[error("Named capture group '{0}' not found in regex")]
    RegexGroupNotFound(String),

    #[error("Header '{0}' not found in response")]
    HeaderNotFound(String),

    #[error("Cookie '{0}' not found in response")]
    CookieNotFound(String),

    #[error("Extraction failed: {0}")]
    Other(String),
}

/// Methods for extracting values from HTTP responses.
#[derive(Debug, Clone)]
pub enum Extractor {
    /// Extract from JSON response using JSONPath (e.g., "$.userId")
    JsonPath { source: String, path: JsonPath },

    /// Extract using regex with named capture group
    Regex { regex: Regex, group: String },

    /// Extract from response header
    Header(String),

    /// Extract from a Set-Cookie header
    Cookie(String),
}

impl Extractor {
    pub fn json_path(path: &str) -> Result<Self, ExtractionError> {
        let parsed = JsonPath::parse(path)
            .map_err(|e| ExtractionError::JsonPathError(format!("Invalid JSONPath: {}", e)))?;
        Ok(Extractor::JsonPath {
            source: path.to_string(),
            path: parsed,
        })
    }

    pub fn regex(pattern: &str, group: &str) -> Result<Self, ExtractionError> {
        let regex = Regex::new(pattern)?;
        if !regex.capture_names().flatten().any(|name| name == group) {
            return Err(ExtractionError::RegexGroupNotFound(group.to_string()));
        }
        Ok(Extractor::Regex {
            regex,
            group: group.to_string(),
        })
    }

    pub fn header(name: &str) -> Self {
        Extractor::Header(name.to_string())
    }

    pub fn cookie(name: &str) -> Self {
        Extractor::Cookie(name.to_string())
    }

    /// Extract a single value from a response.
    pub fn extract(&self, body: &str, headers: &HeaderMap) -> Result<String, ExtractionError> {
        match self {
            Extractor::JsonPath { source, path } => extract_json_path(body, source, path),
            Extractor::Regex { regex, group } => extract_regex(body, regex, group),
            Extractor::Header(name) => extract_header(headers, name),
            Extractor::Cookie(name) => extract_cookie(headers, name),
        }
    }
}

/// Extract a variable from the response for use in subsequent steps.
#[derive(Debug, Clone)]
pub struct VariableExtraction {
    /// Name to store the extracted value under
    pub name: String,

    /// How to extract the value from the response
    pub extractor: Extractor,
}

/// Extract all variables, stopping at the first failure.
///
/// Returns the name of the variable that could not be extracted together
/// with the reason.
pub fn extract_variables(
    extractions: &[VariableExtraction],
    body: &str,
    headers: &HeaderMap,
) -> Result<HashMap<String, String>, (String, ExtractionError)> {
    let mut variables = HashMap::with_capacity(extractions.len());

    for extraction in extractions {
        match extraction.extractor.extract(body, headers) {
            Ok(value) => {
                debug!(
                    variable_name = %extraction.name,
                    value = %value,
                    "Successfully extracted variable"
                );
                variables.insert(extraction.name.clone(), value);
            }
            Err(e) => {
                warn!(
                    variable_name = %extraction.name,
                    error = %e,
                    "Failed to extract variable"
                );
                return Err((extraction.name.clone(), e));
            }
        }
    }

    Ok(variables)
}

fn extract_json_path(
    json_body: &str,
    source: &str,
    path: &JsonPath,
) -> Result<String, ExtractionError> {
    let json: Value =
        serde_json::from_str(json_body).map_err(|e| ExtractionError::InvalidJson(e.to_string()))?;

    match path.query(&json).exactly_one() {
        Ok(Value::String(s)) => Ok(s.clone()),
        Ok(Value::Number(n)) => Ok(n.to_string()),
        Ok(Value::Bool(b)) => Ok(b.to_string()),
        Ok(Value::Null) => Err(ExtractionError::JsonPathError(format!(
            "JSONPath '{}' matched null",
            source
        ))),
        // Return JSON representation for complex types
        Ok(value) => Ok(value.to_string()),
        Err(_) => Err(ExtractionError::JsonPathError(format!(
            "JSONPath '{}' did not match exactly one value",
            source
        ))),
    }
}

fn extract_regex(text: &str, regex: &Regex, group: &str) -> Result<String, ExtractionError> {
    let captures = regex.captures(text).ok_or(ExtractionError::RegexNoMatch)?;
    captures
        .name(group)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ExtractionError::RegexGroupNotFound(group.to_string()))
}

fn extract_header(headers: &HeaderMap, header_name: &str) -> Result<String, ExtractionError> {
    headers
        .get(header_name)
        .ok_or_else(|| ExtractionError::HeaderNotFound(header_name.to_string()))?
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| ExtractionError::Other(format!("Invalid header value: {}", e)))
}

fn extract_cookie(headers: &HeaderMap, cookie_name: &str) -> Result<String, ExtractionError> {
    for value in headers.get_all(reqwest::header::SET_COOKIE) {
        let Ok(cookie_str) = value.to_str() else {
            continue;
        };
        // "name=value; attributes..."
        if let Some((name, val)) = cookie_str.split(';').next().and_then(|p| p.split_once('=')) {
            if name.trim() == cookie_name {
                return Ok(val.trim().to_string());
            }
        }
    }

    Err(ExtractionError::CookieNotFound(cookie_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, CONTENT_TYPE, SET_COOKIE};

    fn extract_json(body: &str, path: &str) -> Result<String, ExtractionError> {
        Extractor::json_path(path)
            .unwrap()
            .extract(body, &HeaderMap::new())
    }

    #[test]
    fn test_extract_json_path_simple() {
        let json = r#"{"userId": 17, "user": {"name": "Alice"}}"#;
        assert_eq!(extract_json(json, "$.userId").unwrap(), "17");
        assert_eq!(extract_json(json, "$.user.name").unwrap(), "Alice");
    }

    #[test]
    fn test_extract_json_path_array() {
        let json = r#"{"products": [{"id": "prod-1"}, {"id": "prod-2"}]}"#;
        assert_eq!(extract_json(json, "$.products[1].id").unwrap(), "prod-2");
    }

    #[test]
    fn test_extract_json_path_missing_or_null() {
        let json = r#"{"orderId": null}"#;
        assert!(extract_json(json, "$.orderId").is_err());
        assert!(extract_json(json, "$.userId").is_err());
    }

    #[test]
    fn test_extract_json_path_invalid_json() {
        let err = extract_json(r#"{"user": "broken"#, "$.user").unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidJson(_)));
    }

    #[test]
    fn test_invalid_json_path_rejected_at_build() {
        assert!(Extractor::json_path("$[").is_err());
    }

    #[test]
    fn test_extract_regex_named_group() {
        let extractor = Extractor::regex(r#"id="user-(?P<id>\d+)""#, "id").unwrap();
        let html = r#"<div id="user-123">Alice</div>"#;
        assert_eq!(extractor.extract(html, &HeaderMap::new()).unwrap(), "123");

        let err = extractor
            .extract("nothing here", &HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, ExtractionError::RegexNoMatch));
    }

    #[test]
    fn test_regex_without_group_rejected_at_build() {
        assert!(Extractor::regex(r"Order #(?P<order>\d+)", "missing").is_err());
        assert!(Extractor::regex(r"(unclosed", "x").is_err());
    }

    #[test]
    fn test_extract_header_and_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            SET_COOKIE,
            HeaderValue::from_static("session_id=abc123; Path=/; HttpOnly"),
        );

        assert_eq!(
            Extractor::header("content-type")
                .extract("", &headers)
                .unwrap(),
            "application/json"
        );
        assert_eq!(
            Extractor::cookie("session_id")
                .extract("", &headers)
                .unwrap(),
            "abc123"
        );
        assert!(Extractor::header("x-missing").extract("", &headers).is_err());
        assert!(Extractor::cookie("missing").extract("", &headers).is_err());
    }

    #[test]
    fn test_extract_variables_stops_at_first_failure() {
        let extractions = vec![
            VariableExtraction {
                name: "user_id".to_string(),
                extractor: Extractor::json_path("$.userId").unwrap(),
            },
            VariableExtraction {
                name: "missing".to_string(),
                extractor: Extractor::json_path("$.does.not.exist").unwrap(),
            },
        ];

        let json = r#"{"userId": "123"}"#;
        let (name, _) = extract_variables(&extractions, json, &HeaderMap::new()).unwrap_err();
        assert_eq!(name, "missing");

        let ok = extract_variables(&extractions[..1], json, &HeaderMap::new()).unwrap();
        assert_eq!(ok.get("user_id"), Some(&"123".to_string()));
    }
}
