//! Actions: the selectable, weighted units of work a virtual user performs.
//!
//! An [`Action`] pairs scheduling metadata (name, weight, tags) with an
//! [`ActionHandler`]. Handlers never perform I/O themselves. `prepare` turns
//! the user's context into a request (or reports an unmet precondition), the
//! runtime sends it, and `absorb` folds a successful reply back into the
//! context. That split keeps the request the only suspension point and lets
//! the runtime own timing, timeouts and classification.

use rand::RngCore;
use reqwest::Method;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::context::{PreconditionUnmet, Template, UserContext};
use crate::errors::ConfigError;
use crate::extractor::{extract_variables, Extractor, VariableExtraction};
use crate::outcome::StatusExpectation;
use crate::transport::{Reply, Request};

/// A request produced by [`ActionHandler::prepare`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: Method,
    /// Path relative to the user's host, or an absolute URL.
    pub path: String,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Values committed to the context only if the request succeeds.
    pub bindings: Vec<(String, String)>,
}

impl PreparedRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// Resolve against a host into a sendable request.
    pub fn to_request(&self, host: &str) -> Request {
        let url = if self.path.starts_with("http://") || self.path.starts_with("https://") {
            self.path.clone()
        } else {
            format!("{}{}", host.trim_end_matches('/'), self.path)
        };
        Request {
            method: self.method.clone(),
            url,
            body: self.body.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// Behaviour behind an action.
pub trait ActionHandler: Send + Sync + fmt::Debug {
    /// Build the request for this invocation.
    ///
    /// Returns [`PreconditionUnmet`] when a context value the request needs
    /// has not been captured yet; the caller skips the action.
    fn prepare(
        &self,
        ctx: &UserContext,
        rng: &mut dyn RngCore,
    ) -> Result<PreparedRequest, PreconditionUnmet>;

    /// Which statuses count as success.
    fn expectation(&self) -> &StatusExpectation;

    /// Fold an accepted reply into the context.
    ///
    /// An `Err` carries the failure reason and turns the outcome into a
    /// failure (e.g. the identifier could not be read from the body).
    fn absorb(
        &self,
        prepared: &PreparedRequest,
        reply: &Reply,
        ctx: &mut UserContext,
    ) -> Result<(), String>;
}

/// An executable, weighted unit of work. Immutable after registration.
#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    weight: u32,
    tags: BTreeSet<String>,
    handler: Arc<dyn ActionHandler>,
}

impl Action {
    pub fn new(name: impl Into<String>, handler: impl ActionHandler + 'static) -> Self {
        Self {
            name: name.into(),
            weight: 1,
            tags: BTreeSet::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn handler(&self) -> &dyn ActionHandler {
        self.handler.as_ref()
    }
}

/// Declarative HTTP action: templated request, preconditions, extractions
/// and a status expectation.
///
/// # Example
/// ```
/// use swarm_loadtest::action::HttpAction;
/// use swarm_loadtest::outcome::StatusExpectation;
///
/// let register = HttpAction::post("/api/users")
///     .unwrap()
///     .json_body(r#"{"email": "user${random:1000:9999}@test.com"}"#)
///     .unwrap()
///     .extract_json("user_id", "$.userId")
///     .unwrap()
///     .expect(StatusExpectation::exactly([201]));
/// # let _ = register;
/// ```
#[derive(Debug, Clone)]
pub struct HttpAction {
    method: Method,
    path: Template,
    body: Option<Template>,
    headers: Vec<(String, Template)>,
    requires: Vec<String>,
    bind: Vec<(String, Template)>,
    extractions: Vec<VariableExtraction>,
    expect: StatusExpectation,
}

impl HttpAction {
    pub fn new(method: Method, path: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            method,
            path: Template::parse(path)?,
            body: None,
            headers: Vec::new(),
            requires: Vec::new(),
            bind: Vec::new(),
            extractions: Vec::new(),
            expect: StatusExpectation::success(),
        })
    }

    pub fn get(path: &str) -> Result<Self, ConfigError> {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str) -> Result<Self, ConfigError> {
        Self::new(Method::POST, path)
    }

    pub fn put(path: &str) -> Result<Self, ConfigError> {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: &str) -> Result<Self, ConfigError> {
        Self::new(Method::DELETE, path)
    }

    /// Raw body template.
    pub fn body(mut self, template: &str) -> Result<Self, ConfigError> {
        self.body = Some(Template::parse(template)?);
        Ok(self)
    }

    /// JSON body template; sets `Content-Type: application/json`.
    pub fn json_body(self, template: &str) -> Result<Self, ConfigError> {
        self.header("Content-Type", "application/json")?
            .body(template)
    }

    pub fn header(mut self, name: &str, template: &str) -> Result<Self, ConfigError> {
        self.headers
            .push((name.to_string(), Template::parse(template)?));
        Ok(self)
    }

    /// Skip the action unless `key` has been captured.
    pub fn requires(mut self, key: &str) -> Self {
        self.requires.push(key.to_string());
        self
    }

    /// Render `template` at prepare time and store it under `key` if the
    /// request succeeds.
    pub fn bind(mut self, key: &str, template: &str) -> Result<Self, ConfigError> {
        self.bind.push((key.to_string(), Template::parse(template)?));
        Ok(self)
    }

    pub fn extract(mut self, name: &str, extractor: Extractor) -> Self {
        self.extractions.push(VariableExtraction {
            name: name.to_string(),
            extractor,
        });
        self
    }

    pub fn extract_json(self, name: &str, path: &str) -> Result<Self, ConfigError> {
        let extractor = Extractor::json_path(path).map_err(|e| ConfigError::InvalidTemplate {
            template: path.to_string(),
            message: e.to_string(),
        })?;
        Ok(self.extract(name, extractor))
    }

    pub fn expect(mut self, expectation: StatusExpectation) -> Self {
        self.expect = expectation;
        self
    }
}

impl ActionHandler for HttpAction {
    fn prepare(
        &self,
        ctx: &UserContext,
        rng: &mut dyn RngCore,
    ) -> Result<PreparedRequest, PreconditionUnmet> {
        for key in &self.requires {
            ctx.require(key)?;
        }

        // Bindings first so the path and body can reference them.
        let mut scratch = None;
        let mut bindings = Vec::with_capacity(self.bind.len());
        for (key, template) in &self.bind {
            let value = template.render(scratch.as_ref().unwrap_or(ctx), rng)?;
            scratch.get_or_insert_with(|| ctx.clone()).set(key.clone(), value.clone());
            bindings.push((key.clone(), value));
        }
        let view = scratch.as_ref().unwrap_or(ctx);

        let mut prepared = PreparedRequest::new(self.method.clone(), self.path.render(view, rng)?);
        if let Some(body) = &self.body {
            prepared.body = Some(body.render(view, rng)?);
        }
        for (name, template) in &self.headers {
            prepared
                .headers
                .push((name.clone(), template.render(view, rng)?));
        }
        prepared.bindings = bindings;
        Ok(prepared)
    }

    fn expectation(&self) -> &StatusExpectation {
        &self.expect
    }

    fn absorb(
        &self,
        prepared: &PreparedRequest,
        reply: &Reply,
        ctx: &mut UserContext,
    ) -> Result<(), String> {
        let extracted = extract_variables(&self.extractions, &reply.body, &reply.headers)
            .map_err(|(name, e)| {
                format!("could not extract '{}' from response body: {}", name, e)
            })?;
        for (key, value) in &prepared.bindings {
            ctx.set(key.clone(), value.clone());
        }
        for (key, value) in extracted {
            ctx.set(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    #[test]
    fn test_prepare_renders_request() {
        let action = HttpAction::post("/api/orders")
            .unwrap()
            .json_body(r#"{"orderDesc": "Order for user ${user_id}"}"#)
            .unwrap()
            .requires("product_id");
        let mut ctx = UserContext::new();
        ctx.set("user_id", "5");
        ctx.set("product_id", "3");
        let mut rng = StdRng::seed_from_u64(1);

        let prepared = action.prepare(&ctx, &mut rng).unwrap();
        assert_eq!(prepared.method, Method::POST);
        assert_eq!(prepared.path, "/api/orders");
        assert_eq!(
            prepared.body.as_deref(),
            Some(r#"{"orderDesc": "Order for user 5"}"#)
        );
        assert_eq!(
            prepared.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn test_prepare_reports_unmet_precondition() {
        let action = HttpAction::post("/api/orders").unwrap().requires("user_id");
        let ctx = UserContext::new();
        let mut rng = StdRng::seed_from_u64(1);

        let err = action.prepare(&ctx, &mut rng).unwrap_err();
        assert_eq!(err.key, "user_id");

        let view = HttpAction::get("/api/orders/${order_id}").unwrap();
        assert_eq!(view.prepare(&ctx, &mut rng).unwrap_err().key, "order_id");
    }

    #[test]
    fn test_bindings_commit_only_on_absorb() {
        let action = HttpAction::get("/api/products/${product_id}")
            .unwrap()
            .bind("product_id", "${random:1:10}")
            .unwrap();
        let mut ctx = UserContext::new();
        let mut rng = StdRng::seed_from_u64(3);

        let prepared = action.prepare(&ctx, &mut rng).unwrap();
        let (_, bound) = &prepared.bindings[0];
        assert_eq!(prepared.path, format!("/api/products/{}", bound));
        assert!(!ctx.contains("product_id"));

        let reply = Reply::new(404, "", Duration::from_millis(1));
        action.absorb(&prepared, &reply, &mut ctx).unwrap();
        assert_eq!(ctx.get("product_id"), Some(bound.as_str()));
    }

    #[test]
    fn test_absorb_extracts_identifier() {
        let action = HttpAction::post("/api/users")
            .unwrap()
            .extract_json("user_id", "$.userId")
            .unwrap();
        let mut ctx = UserContext::new();
        let prepared = PreparedRequest::new(Method::POST, "/api/users");

        let reply = Reply::new(201, r#"{"userId": 42}"#, Duration::from_millis(1));
        action.absorb(&prepared, &reply, &mut ctx).unwrap();
        assert_eq!(ctx.get("user_id"), Some("42"));

        let bad = Reply::new(201, "not json", Duration::from_millis(1));
        let reason = action.absorb(&prepared, &bad, &mut ctx).unwrap_err();
        assert!(
            reason.starts_with("could not extract 'user_id' from response body"),
            "reason was: {}",
            reason
        );
    }

    #[test]
    fn test_to_request_joins_host() {
        let prepared = PreparedRequest::new(Method::GET, "/api/users");
        assert_eq!(
            prepared.to_request("http://localhost:8700/").url,
            "http://localhost:8700/api/users"
        );

        let absolute = PreparedRequest::new(Method::GET, "https://other.example.com/health");
        assert_eq!(
            absolute.to_request("http://localhost:8700").url,
            "https://other.example.com/health"
        );
    }

    #[test]
    fn test_action_metadata() {
        let action = Action::new("get_all_users", HttpAction::get("/api/users").unwrap())
            .with_weight(3)
            .with_tags(["user-service", "read"]);
        assert_eq!(action.name(), "get_all_users");
        assert_eq!(action.weight(), 3);
        assert!(action.tags().contains("read"));
    }
}
