//! Per-user execution context and request templates.
//!
//! Every virtual user owns exactly one [`UserContext`]. Journey steps read
//! identifiers captured by earlier steps from it; reading a key that was
//! never captured is not an error but a [`PreconditionUnmet`] signal that
//! makes the reading step skip.

use rand::{Rng, RngCore};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::ConfigError;

/// A step could not run because a context value it needs is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionUnmet {
    pub key: String,
}

impl fmt::Display for PreconditionUnmet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context value '{}' is not set", self.key)
    }
}

/// Mutable scratch state of one virtual user.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    variables: HashMap<String, String>,
}

impl UserContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a variable for use in subsequent steps.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Get a previously stored variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Get a variable, treating absence as an unmet precondition.
    pub fn require(&self, name: &str) -> Result<&str, PreconditionUnmet> {
        self.get(name).ok_or_else(|| PreconditionUnmet {
            key: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.variables.remove(name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn clear(&mut self) {
        self.variables.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Variable(String),
    Timestamp,
    Random { min: i64, max: i64 },
}

/// A parsed string template.
///
/// Supported placeholders:
/// - `${name}` - a context variable (absent ⇒ precondition unmet)
/// - `${timestamp}` - current Unix time in milliseconds
/// - `${random:MIN:MAX}` - uniform integer in `[MIN, MAX]`
///
/// Templates are parsed once when a plan is built so malformed placeholders
/// are configuration errors rather than per-request failures.
///
/// # Example
/// ```
/// use swarm_loadtest::context::{Template, UserContext};
/// use rand::SeedableRng;
///
/// let template = Template::parse("/api/orders/${order_id}").unwrap();
/// let mut ctx = UserContext::new();
/// let mut rng = rand::rngs::StdRng::seed_from_u64(7);
/// assert!(template.render(&ctx, &mut rng).is_err());
///
/// ctx.set("order_id", "42");
/// assert_eq!(template.render(&ctx, &mut rng).unwrap(), "/api/orders/42");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidTemplate {
            template: source.to_string(),
            message,
        };

        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| invalid("unterminated '${' placeholder".to_string()))?;
            let name = after[..end].trim();
            segments.push(Self::parse_placeholder(name).map_err(invalid)?);
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    fn parse_placeholder(name: &str) -> Result<Segment, String> {
        if name.is_empty() {
            return Err("empty placeholder".to_string());
        }
        if name == "timestamp" {
            return Ok(Segment::Timestamp);
        }
        if let Some(range) = name.strip_prefix("random:") {
            let (min, max) = range
                .split_once(':')
                .ok_or_else(|| format!("expected random:MIN:MAX, got '{}'", name))?;
            let min: i64 = min
                .trim()
                .parse()
                .map_err(|e| format!("invalid random minimum '{}': {}", min, e))?;
            let max: i64 = max
                .trim()
                .parse()
                .map_err(|e| format!("invalid random maximum '{}': {}", max, e))?;
            if min > max {
                return Err(format!("random minimum {} exceeds maximum {}", min, max));
            }
            return Ok(Segment::Random { min, max });
        }
        Ok(Segment::Variable(name.to_string()))
    }

    /// Context keys this template reads.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// The template text as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render against a context, drawing random placeholders from `rng`.
    pub fn render(
        &self,
        ctx: &UserContext,
        rng: &mut dyn RngCore,
    ) -> Result<String, PreconditionUnmet> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => out.push_str(ctx.require(name)?),
                Segment::Timestamp => {
                    let millis = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis())
                        .unwrap_or_default();
                    out.push_str(&millis.to_string());
                }
                Segment::Random { min, max } => {
                    let value = rng.gen_range(*min..=*max);
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(out)
    }
}
