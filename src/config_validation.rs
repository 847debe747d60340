//! Field-level validation of YAML test plans.
//!
//! Validators return a single [`ValidationError`]; a [`ValidationContext`]
//! walks the plan, records the dotted path of the field being checked and
//! collects every error so a broken plan is reported in one pass.

use thiserror::Error;

use crate::context::Template;
use crate::extractor::Extractor;

/// Validation error with context about which field failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Field '{field}': {message}")]
    FieldError { field: String, message: String },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}': invalid format - {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}': invalid enum value '{value}'. Expected one of: {expected}")]
    InvalidEnum {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Collects errors while walking a nested structure.
#[derive(Debug, Default)]
pub struct ValidationContext {
    field_path: Vec<String>,
    errors: Vec<ValidationError>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a nested field context.
    pub fn enter(&mut self, field: &str) {
        self.field_path.push(field.to_string());
    }

    /// Exit the current field context.
    pub fn exit(&mut self) {
        self.field_path.pop();
    }

    /// Run `f` inside the `field` context.
    pub fn scope<F: FnOnce(&mut Self)>(&mut self, field: &str, f: F) {
        self.enter(field);
        f(self);
        self.exit();
    }

    /// Get the current field path as a string.
    pub fn current_path(&self) -> String {
        self.field_path.join(".")
    }

    /// Add a validation error.
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Add a field error with automatic path.
    pub fn field_error(&mut self, message: impl Into<String>) {
        self.add_error(ValidationError::FieldError {
            field: self.current_path(),
            message: message.into(),
        });
    }

    /// Record the outcome of a validator, re-labelled with the current path.
    pub fn check(&mut self, result: ValidationResult<()>) {
        if let Err(e) = result {
            let path = self.current_path();
            self.add_error(with_field(e, path));
        }
    }

    /// Check if any errors were collected.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Get all collected errors.
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Consume the context and return a result.
    pub fn into_result(self) -> Result<(), ValidationError> {
        let mut errors = self.errors;
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => {
                let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                Err(ValidationError::Multiple(messages.join("; ")))
            }
        }
    }
}

fn with_field(error: ValidationError, path: String) -> ValidationError {
    match error {
        ValidationError::FieldError { message, .. } => ValidationError::FieldError {
            field: path,
            message,
        },
        ValidationError::OutOfRange { value, min, max, .. } => ValidationError::OutOfRange {
            field: path,
            value,
            min,
            max,
        },
        ValidationError::InvalidFormat { message, .. } => ValidationError::InvalidFormat {
            field: path,
            message,
        },
        ValidationError::InvalidEnum {
            value, expected, ..
        } => ValidationError::InvalidEnum {
            field: path,
            value,
            expected,
        },
        multiple @ ValidationError::Multiple(_) => multiple,
    }
}

/// Validator for host URLs.
pub struct UrlValidator;

impl UrlValidator {
    pub fn validate(url: &str) -> ValidationResult<()> {
        let invalid = |message: String| ValidationError::InvalidFormat {
            field: "host".to_string(),
            message,
        };

        if url.is_empty() {
            return Err(invalid("URL cannot be empty".to_string()));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(invalid(format!(
                "URL must start with http:// or https://, got: {}",
                url
            )));
        }
        if url.contains(' ') {
            return Err(invalid("URL cannot contain spaces".to_string()));
        }
        Ok(())
    }
}

/// Validator for duration strings such as `500ms` or `5m`.
pub struct DurationValidator;

impl DurationValidator {
    pub fn validate(duration_str: &str) -> ValidationResult<()> {
        crate::utils::parse_duration_string(duration_str)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidFormat {
                field: "duration".to_string(),
                message: format!("Invalid duration format '{}': {}", duration_str, e),
            })
    }
}

/// Validator for numeric ranges.
pub struct RangeValidator;

impl RangeValidator {
    pub fn validate_u64(value: u64, min: u64, max: u64, field: &str) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_positive_u64(value: u64, field: &str) -> ValidationResult<()> {
        Self::validate_u64(value, 1, u64::MAX, field).map_err(|_| ValidationError::OutOfRange {
            field: field.to_string(),
            value: value.to_string(),
            min: "1".to_string(),
            max: "unlimited".to_string(),
        })
    }

    pub fn validate_positive_f64(value: f64, field: &str) -> ValidationResult<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: "0.0 (exclusive)".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(())
    }
}

/// Validator for HTTP methods.
pub struct HttpMethodValidator;

impl HttpMethodValidator {
    const VALID_METHODS: &'static [&'static str] =
        &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

    pub fn validate(method: &str) -> ValidationResult<()> {
        let method_upper = method.to_uppercase();
        if !Self::VALID_METHODS.contains(&method_upper.as_str()) {
            return Err(ValidationError::InvalidEnum {
                field: "method".to_string(),
                value: method.to_string(),
                expected: Self::VALID_METHODS.join(", "),
            });
        }
        Ok(())
    }
}

/// Validator for `${...}` request templates.
pub struct TemplateValidator;

impl TemplateValidator {
    pub fn validate(template: &str) -> ValidationResult<()> {
        Template::parse(template)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidFormat {
                field: "template".to_string(),
                message: e.to_string(),
            })
    }
}

/// Validator for extraction rules.
pub struct ExtractorValidator;

impl ExtractorValidator {
    pub fn validate_json_path(path: &str) -> ValidationResult<()> {
        Extractor::json_path(path)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidFormat {
                field: "jsonPath".to_string(),
                message: e.to_string(),
            })
    }

    pub fn validate_regex(pattern: &str, group: &str) -> ValidationResult<()> {
        Extractor::regex(pattern, group)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidFormat {
                field: "regex".to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validator() {
        assert!(UrlValidator::validate("https://example.com").is_ok());
        assert!(UrlValidator::validate("http://localhost:8700").is_ok());
        assert!(UrlValidator::validate("").is_err());
        assert!(UrlValidator::validate("localhost:8700").is_err());
        assert!(UrlValidator::validate("https://example .com").is_err());
    }

    #[test]
    fn test_duration_validator() {
        assert!(DurationValidator::validate("500ms").is_ok());
        assert!(DurationValidator::validate("5m").is_ok());
        assert!(DurationValidator::validate("soon").is_err());
    }

    #[test]
    fn test_range_validators() {
        assert!(RangeValidator::validate_u64(50, 1, 100, "users").is_ok());
        assert!(RangeValidator::validate_u64(101, 1, 100, "users").is_err());
        assert!(RangeValidator::validate_positive_u64(0, "weight").is_err());
        assert!(RangeValidator::validate_positive_f64(0.5, "spawnRate").is_ok());
        assert!(RangeValidator::validate_positive_f64(0.0, "spawnRate").is_err());
        assert!(RangeValidator::validate_positive_f64(f64::INFINITY, "spawnRate").is_err());
    }

    #[test]
    fn test_http_method_validator() {
        assert!(HttpMethodValidator::validate("GET").is_ok());
        assert!(HttpMethodValidator::validate("delete").is_ok());
        assert!(HttpMethodValidator::validate("FETCH").is_err());
    }

    #[test]
    fn test_template_and_extractor_validators() {
        assert!(TemplateValidator::validate("/api/orders/${order_id}").is_ok());
        assert!(TemplateValidator::validate("/api/orders/${order_id").is_err());
        assert!(ExtractorValidator::validate_json_path("$.userId").is_ok());
        assert!(ExtractorValidator::validate_json_path("$[").is_err());
        assert!(ExtractorValidator::validate_regex(r"#(?P<id>\d+)", "id").is_ok());
        assert!(ExtractorValidator::validate_regex(r"#(\d+)", "id").is_err());
    }

    #[test]
    fn test_validation_context_paths() {
        let mut ctx = ValidationContext::new();

        ctx.enter("userTypes");
        ctx.enter("UserUser");
        assert_eq!(ctx.current_path(), "userTypes.UserUser");
        ctx.scope("host", |ctx| ctx.check(UrlValidator::validate("nope")));
        ctx.exit();
        ctx.exit();
        assert_eq!(ctx.current_path(), "");

        assert!(ctx.has_errors());
        match &ctx.errors()[0] {
            ValidationError::InvalidFormat { field, .. } => {
                assert_eq!(field, "userTypes.UserUser.host")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_into_result_joins_multiple_errors() {
        let mut ctx = ValidationContext::new();
        assert!(ValidationContext::new().into_result().is_ok());

        ctx.field_error("first");
        ctx.field_error("second");
        let err = ctx.into_result().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("first") && message.contains("second"));
    }
}
