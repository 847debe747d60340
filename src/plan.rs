//! YAML test plans.
//!
//! A plan file declares the user types of a run (host, weight, wait time,
//! weighted tasks or a journey, start/stop hooks) and optional run
//! defaults. It is parsed with serde, validated field by field with a
//! [`ValidationContext`], then converted into a [`TestPlan`].
//!
//! ```yaml
//! version: "1.0"
//! run:
//!   users: 100
//!   spawnRate: 10
//!   duration: 5m
//! userTypes:
//!   ProductUser:
//!     host: http://localhost:8701
//!     tasks:
//!       - name: get_all_products
//!         weight: 3
//!         request: { method: GET, path: /api/products }
//! ```

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::action::{Action, HttpAction};
use crate::config_validation::{
    DurationValidator, ExtractorValidator, HttpMethodValidator, RangeValidator,
    TemplateValidator, UrlValidator, ValidationContext,
};
use crate::errors::ConfigError;
use crate::extractor::Extractor;
use crate::journey::{Journey, JourneyStep, RetryPolicy};
use crate::outcome::StatusExpectation;
use crate::pool::{RunConfig, TestPlan, UserType};
use crate::user::WaitTime;

const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// Errors that can occur when loading a plan file.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Failed to read plan file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid plan: {0}")]
    Validation(String),

    #[error(transparent)]
    Build(#[from] ConfigError),
}

/// Duration format for YAML (e.g., `30`, `"30s"`, `"500ms"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlDuration {
    Seconds(u64),
    String(String),
}

impl YamlDuration {
    pub fn to_duration(&self) -> Result<Duration, PlanError> {
        match self {
            YamlDuration::Seconds(s) => Ok(Duration::from_secs(*s)),
            YamlDuration::String(s) => crate::utils::parse_duration_string(s)
                .map_err(|e| PlanError::Validation(format!("Invalid duration '{}': {}", s, e))),
        }
    }

    fn validate(&self, ctx: &mut ValidationContext) {
        if let YamlDuration::String(s) = self {
            ctx.check(DurationValidator::validate(s));
        }
    }
}

/// A fixed wait (`waitTime: 2s`) or a uniform range (`{min: 1s, max: 3s}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlWaitTime {
    Fixed(YamlDuration),
    Between { min: YamlDuration, max: YamlDuration },
}

impl YamlWaitTime {
    pub fn to_wait_time(&self) -> Result<WaitTime, PlanError> {
        match self {
            YamlWaitTime::Fixed(d) => Ok(WaitTime::constant(d.to_duration()?)),
            YamlWaitTime::Between { min, max } => {
                Ok(WaitTime::between(min.to_duration()?, max.to_duration()?)?)
            }
        }
    }

    fn validate(&self, ctx: &mut ValidationContext) {
        match self {
            YamlWaitTime::Fixed(d) => d.validate(ctx),
            YamlWaitTime::Between { min, max } => {
                ctx.scope("min", |ctx| min.validate(ctx));
                ctx.scope("max", |ctx| max.validate(ctx));
                if let (Ok(min), Ok(max)) = (min.to_duration(), max.to_duration()) {
                    if min > max {
                        ctx.field_error(format!(
                            "min wait {:?} exceeds max wait {:?}",
                            min, max
                        ));
                    }
                }
            }
        }
    }
}

/// Metadata about the plan.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct YamlMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
}

/// Run defaults. Environment variables take precedence.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct YamlRunSettings {
    pub users: Option<usize>,

    #[serde(rename = "spawnRate")]
    pub spawn_rate: Option<f64>,

    pub duration: Option<YamlDuration>,

    #[serde(rename = "waitTime")]
    pub wait_time: Option<YamlWaitTime>,

    #[serde(rename = "requestTimeout")]
    pub request_timeout: Option<YamlDuration>,

    pub seed: Option<u64>,
}

/// Request section of an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlRequest {
    pub method: String,
    pub path: String,

    /// Raw body template.
    pub body: Option<String>,

    /// JSON body template, sent with `Content-Type: application/json`.
    pub json: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Extractor definition in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum YamlExtractor {
    #[serde(rename = "jsonPath")]
    JsonPath {
        name: String,
        #[serde(rename = "jsonPath")]
        json_path: String,
    },
    #[serde(rename = "regex")]
    Regex {
        name: String,
        regex: String,
        /// Named capture group; defaults to the variable name.
        group: Option<String>,
    },
    #[serde(rename = "header")]
    Header { name: String, header: String },
    #[serde(rename = "cookie")]
    Cookie { name: String, cookie: String },
}

impl YamlExtractor {
    fn name(&self) -> &str {
        match self {
            YamlExtractor::JsonPath { name, .. }
            | YamlExtractor::Regex { name, .. }
            | YamlExtractor::Header { name, .. }
            | YamlExtractor::Cookie { name, .. } => name,
        }
    }
}

/// Accepted statuses. Absent means any 2xx/3xx.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct YamlExpect {
    pub status: Option<Vec<u16>>,

    #[serde(rename = "alsoAccept", default)]
    pub also_accept: Vec<u16>,
}

impl YamlExpect {
    fn to_expectation(&self) -> StatusExpectation {
        let base = match &self.status {
            Some(statuses) => StatusExpectation::exactly(statuses.iter().copied()),
            None => StatusExpectation::success(),
        };
        base.also(self.also_accept.iter().copied())
    }
}

/// One named request, usable as a task, a journey step or a hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlAction {
    pub name: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub tags: Vec<String>,

    pub request: YamlRequest,

    /// Context keys that must be present, otherwise the action is skipped.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Values rendered before the request and stored on success.
    #[serde(default)]
    pub bind: BTreeMap<String, String>,

    #[serde(default)]
    pub extract: Vec<YamlExtractor>,

    #[serde(default)]
    pub expect: YamlExpect,
}

fn default_weight() -> u32 {
    1
}

impl YamlAction {
    fn validate(&self, ctx: &mut ValidationContext) {
        ctx.scope("name", |ctx| {
            if self.name.trim().is_empty() {
                ctx.field_error("Action name cannot be empty");
            }
        });
        ctx.scope("weight", |ctx| {
            ctx.check(RangeValidator::validate_positive_u64(
                u64::from(self.weight),
                "weight",
            ))
        });

        ctx.enter("request");
        ctx.scope("method", |ctx| {
            ctx.check(HttpMethodValidator::validate(&self.request.method))
        });
        ctx.scope("path", |ctx| {
            if self.request.path.is_empty() {
                ctx.field_error("Request path cannot be empty");
            }
            ctx.check(TemplateValidator::validate(&self.request.path));
        });
        if self.request.body.is_some() && self.request.json.is_some() {
            ctx.field_error("Only one of 'body' and 'json' may be set");
        }
        for (field, template) in [("body", &self.request.body), ("json", &self.request.json)] {
            if let Some(template) = template {
                ctx.scope(field, |ctx| ctx.check(TemplateValidator::validate(template)));
            }
        }
        ctx.enter("headers");
        for (name, template) in &self.request.headers {
            ctx.scope(name, |ctx| ctx.check(TemplateValidator::validate(template)));
        }
        ctx.exit();
        ctx.exit(); // request

        ctx.enter("bind");
        for (key, template) in &self.bind {
            ctx.scope(key, |ctx| ctx.check(TemplateValidator::validate(template)));
        }
        ctx.exit();

        ctx.enter("extract");
        for (idx, extractor) in self.extract.iter().enumerate() {
            ctx.enter(&format!("[{}]", idx));
            if extractor.name().trim().is_empty() {
                ctx.field_error("Extracted variable name cannot be empty");
            }
            match extractor {
                YamlExtractor::JsonPath { json_path, .. } => {
                    ctx.check(ExtractorValidator::validate_json_path(json_path))
                }
                YamlExtractor::Regex { name, regex, group } => ctx.check(
                    ExtractorValidator::validate_regex(regex, group.as_deref().unwrap_or(name)),
                ),
                YamlExtractor::Header { .. } | YamlExtractor::Cookie { .. } => {}
            }
            ctx.exit();
        }
        ctx.exit();
    }

    /// Build the runtime action. Assumes the plan has been validated.
    pub fn to_action(&self) -> Result<Action, PlanError> {
        let method = Method::from_bytes(self.request.method.to_uppercase().as_bytes())
            .map_err(|e| {
                PlanError::Validation(format!(
                    "Invalid method '{}' for action '{}': {}",
                    self.request.method, self.name, e
                ))
            })?;

        let mut http = HttpAction::new(method, &self.request.path)?;
        if let Some(body) = &self.request.body {
            http = http.body(body)?;
        }
        if let Some(json) = &self.request.json {
            http = http.json_body(json)?;
        }
        for (name, template) in &self.request.headers {
            http = http.header(name, template)?;
        }
        for key in &self.requires {
            http = http.requires(key);
        }
        for (key, template) in &self.bind {
            http = http.bind(key, template)?;
        }
        for extractor in &self.extract {
            http = match extractor {
                YamlExtractor::JsonPath { name, json_path } => http.extract_json(name, json_path)?,
                YamlExtractor::Regex { name, regex, group } => {
                    let group = group.as_deref().unwrap_or(name);
                    let compiled = Extractor::regex(regex, group).map_err(|e| {
                        ConfigError::InvalidTemplate {
                            template: regex.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    http.extract(name, compiled)
                }
                YamlExtractor::Header { name, header } => {
                    http.extract(name, Extractor::header(header))
                }
                YamlExtractor::Cookie { name, cookie } => {
                    http.extract(name, Extractor::cookie(cookie))
                }
            };
        }
        http = http.expect(self.expect.to_expectation());

        Ok(Action::new(self.name.clone(), http)
            .with_weight(self.weight)
            .with_tags(self.tags.iter().cloned()))
    }
}

/// A journey step: an action plus its step policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlJourneyStep {
    #[serde(flatten)]
    pub action: YamlAction,

    /// Optional steps never abort the journey.
    #[serde(default)]
    pub optional: bool,

    #[serde(rename = "maxAttempts")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlJourney {
    pub name: String,
    pub steps: Vec<YamlJourneyStep>,
}

impl YamlJourney {
    pub fn to_journey(&self) -> Result<Journey, PlanError> {
        let steps = self
            .steps
            .iter()
            .map(|step| {
                let action = step.action.to_action()?;
                let journey_step = if step.optional {
                    JourneyStep::optional(action)
                } else {
                    JourneyStep::required(action)
                };
                Ok(match step.max_attempts {
                    Some(n) => journey_step.with_retry(RetryPolicy::attempts(n)),
                    None => journey_step,
                })
            })
            .collect::<Result<Vec<_>, PlanError>>()?;
        Ok(Journey::new(self.name.clone(), steps)?)
    }
}

/// A user type declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlUserType {
    pub host: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(rename = "waitTime")]
    pub wait_time: Option<YamlWaitTime>,

    pub tasks: Option<Vec<YamlAction>>,

    pub journey: Option<YamlJourney>,

    #[serde(rename = "onStart")]
    pub on_start: Option<YamlAction>,

    #[serde(rename = "onStop")]
    pub on_stop: Option<YamlAction>,
}

impl YamlUserType {
    fn validate(&self, ctx: &mut ValidationContext) {
        ctx.scope("host", |ctx| ctx.check(UrlValidator::validate(&self.host)));
        ctx.scope("weight", |ctx| {
            ctx.check(RangeValidator::validate_positive_u64(
                u64::from(self.weight),
                "weight",
            ))
        });
        if let Some(wait_time) = &self.wait_time {
            ctx.scope("waitTime", |ctx| wait_time.validate(ctx));
        }

        match (&self.tasks, &self.journey) {
            (Some(_), Some(_)) => ctx.field_error("Define either 'tasks' or 'journey', not both"),
            (None, None) => ctx.field_error("One of 'tasks' or 'journey' must be defined"),
            (Some(tasks), None) => {
                ctx.enter("tasks");
                if tasks.is_empty() {
                    ctx.field_error("At least one task must be defined");
                }
                for (idx, task) in tasks.iter().enumerate() {
                    ctx.scope(&format!("[{}]", idx), |ctx| task.validate(ctx));
                }
                ctx.exit();
            }
            (None, Some(journey)) => {
                ctx.enter("journey");
                if journey.name.trim().is_empty() {
                    ctx.scope("name", |ctx| ctx.field_error("Journey name cannot be empty"));
                }
                ctx.enter("steps");
                if journey.steps.is_empty() {
                    ctx.field_error(format!(
                        "Journey '{}' must have at least one step",
                        journey.name
                    ));
                }
                for (idx, step) in journey.steps.iter().enumerate() {
                    ctx.enter(&format!("[{}]", idx));
                    step.action.validate(ctx);
                    if let Some(n) = step.max_attempts {
                        ctx.scope("maxAttempts", |ctx| {
                            ctx.check(RangeValidator::validate_positive_u64(
                                u64::from(n),
                                "maxAttempts",
                            ))
                        });
                    }
                    ctx.exit();
                }
                ctx.exit(); // steps
                ctx.exit(); // journey
            }
        }

        if let Some(hook) = &self.on_start {
            ctx.scope("onStart", |ctx| hook.validate(ctx));
        }
        if let Some(hook) = &self.on_stop {
            ctx.scope("onStop", |ctx| hook.validate(ctx));
        }
    }

    pub fn to_user_type(&self) -> Result<UserType, PlanError> {
        let mut user_type = match (&self.tasks, &self.journey) {
            (Some(tasks), None) => UserType::tasks(
                self.host.clone(),
                tasks
                    .iter()
                    .map(YamlAction::to_action)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            (None, Some(journey)) => UserType::journey(self.host.clone(), journey.to_journey()?),
            _ => {
                return Err(PlanError::Validation(
                    "exactly one of 'tasks' or 'journey' must be defined".to_string(),
                ))
            }
        }
        .with_weight(self.weight);

        if let Some(wait_time) = &self.wait_time {
            user_type = user_type.with_wait_time(wait_time.to_wait_time()?);
        }
        if let Some(hook) = &self.on_start {
            user_type = user_type.with_on_start(hook.to_action()?);
        }
        if let Some(hook) = &self.on_stop {
            user_type = user_type.with_on_stop(hook.to_action()?);
        }
        Ok(user_type)
    }
}

/// Root of a plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlPlan {
    pub version: String,

    #[serde(default)]
    pub metadata: YamlMetadata,

    #[serde(default)]
    pub run: YamlRunSettings,

    #[serde(rename = "userTypes")]
    pub user_types: BTreeMap<String, YamlUserType>,
}

impl YamlPlan {
    /// Load a plan from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PlanError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate a plan from a YAML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, PlanError> {
        let plan: YamlPlan = serde_yaml::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<(), PlanError> {
        let mut ctx = ValidationContext::new();

        ctx.scope("version", |ctx| {
            if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
                ctx.field_error(format!(
                    "Unsupported version '{}'. Supported: {}",
                    self.version,
                    SUPPORTED_VERSIONS.join(", ")
                ));
            }
        });

        ctx.enter("run");
        if let Some(users) = self.run.users {
            ctx.scope("users", |ctx| {
                ctx.check(RangeValidator::validate_positive_u64(users as u64, "users"))
            });
        }
        if let Some(rate) = self.run.spawn_rate {
            ctx.scope("spawnRate", |ctx| {
                ctx.check(RangeValidator::validate_positive_f64(rate, "spawnRate"))
            });
        }
        if let Some(duration) = &self.run.duration {
            ctx.scope("duration", |ctx| duration.validate(ctx));
        }
        if let Some(wait_time) = &self.run.wait_time {
            ctx.scope("waitTime", |ctx| wait_time.validate(ctx));
        }
        if let Some(timeout) = &self.run.request_timeout {
            ctx.scope("requestTimeout", |ctx| timeout.validate(ctx));
        }
        ctx.exit(); // run

        ctx.enter("userTypes");
        if self.user_types.is_empty() {
            ctx.field_error("At least one user type must be defined");
        }
        for (name, user_type) in &self.user_types {
            ctx.scope(name, |ctx| user_type.validate(ctx));
        }
        ctx.exit();

        ctx.into_result()
            .map_err(|e| PlanError::Validation(e.to_string()))
    }

    /// Build the registered user types.
    pub fn to_test_plan(&self) -> Result<TestPlan, PlanError> {
        let mut plan = TestPlan::new();
        for (name, user_type) in &self.user_types {
            plan.add_user_type(name.clone(), user_type.to_user_type()?);
        }
        Ok(plan)
    }

    /// Apply the plan's `run:` defaults on top of `config`.
    pub fn apply_run_settings(&self, config: &mut RunConfig) -> Result<(), PlanError> {
        let run = &self.run;
        if let Some(users) = run.users {
            config.target_concurrency = users;
        }
        if let Some(rate) = run.spawn_rate {
            config.spawn_rate = rate;
        }
        if let Some(duration) = &run.duration {
            config.duration = Some(duration.to_duration()?);
        }
        if let Some(wait_time) = &run.wait_time {
            config.wait_time = wait_time.to_wait_time()?;
        }
        if let Some(timeout) = &run.request_timeout {
            config.request_timeout = timeout.to_duration()?;
        }
        if run.seed.is_some() {
            config.seed = run.seed;
        }
        Ok(())
    }
}
