use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use tokio::time::Duration;

use crate::client::ClientConfig;
use crate::errors::ConfigError;
use crate::pool::RunConfig;
use crate::scheduler::TagFilter;
use crate::user::WaitTime;
use crate::utils::{parse_duration_string, parse_key_value_list, parse_list};

/// Runtime settings read from environment variables.
///
/// Run parameters are optional here: unset variables fall back to the
/// plan's `run:` section and then to built-in defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub plan_file: String,
    pub users: Option<usize>,
    pub spawn_rate: Option<f64>,
    pub test_duration: Option<Duration>,
    pub wait_min: Option<Duration>,
    pub wait_max: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub hosts: Vec<(String, String)>,
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub random_seed: Option<u64>,
    pub stats_interval: Duration,
    /// Write the final snapshot as JSON to this path.
    pub stats_json: Option<String>,
    pub metrics_port: u16,
    pub json_logs: bool,
    pub skip_tls_verify: bool,
    pub custom_headers: Option<String>,
}

fn env_value(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn invalid(var: &str, message: impl Display) -> ConfigError {
    ConfigError::InvalidEnv {
        var: var.to_string(),
        message: message.to_string(),
    }
}

fn parse_env<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    env_value(var)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| invalid(var, format!("'{}': {}", raw, e)))
        })
        .transpose()
}

fn duration_env(var: &str) -> Result<Option<Duration>, ConfigError> {
    env_value(var)
        .map(|raw| parse_duration_string(&raw).map_err(|e| invalid(var, e)))
        .transpose()
}

fn bool_env(var: &str) -> bool {
    env_value(var).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let plan_file = env_value("PLAN_FILE").ok_or_else(|| ConfigError::MissingEnv {
            var: "PLAN_FILE".to_string(),
        })?;

        let users = parse_env::<usize>("SWARM_USERS")?;
        if users == Some(0) {
            return Err(invalid("SWARM_USERS", "must be greater than 0"));
        }

        let spawn_rate = parse_env::<f64>("SPAWN_RATE")?;
        if let Some(rate) = spawn_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(invalid("SPAWN_RATE", format!("must be positive, got {}", rate)));
            }
        }

        let hosts = env_value("HOSTS")
            .map(|raw| parse_key_value_list(&raw).map_err(|e| invalid("HOSTS", e)))
            .transpose()?
            .unwrap_or_default();

        let stats_interval = duration_env("STATS_INTERVAL")?.unwrap_or(Duration::from_secs(5));
        if stats_interval.is_zero() {
            return Err(invalid("STATS_INTERVAL", "must be greater than 0"));
        }

        Ok(Config {
            plan_file,
            users,
            spawn_rate,
            test_duration: duration_env("TEST_DURATION")?,
            wait_min: duration_env("WAIT_MIN")?,
            wait_max: duration_env("WAIT_MAX")?,
            request_timeout: duration_env("REQUEST_TIMEOUT")?,
            hosts,
            tags: env_value("TAGS").map(|t| parse_list(&t)).unwrap_or_default(),
            exclude_tags: env_value("EXCLUDE_TAGS")
                .map(|t| parse_list(&t))
                .unwrap_or_default(),
            random_seed: parse_env("RANDOM_SEED")?,
            stats_interval,
            stats_json: env_value("STATS_JSON"),
            metrics_port: parse_env("METRICS_PORT")?.unwrap_or(9090),
            json_logs: env_value("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            skip_tls_verify: bool_env("SKIP_TLS_VERIFY"),
            custom_headers: env_value("CUSTOM_HEADERS"),
        })
    }

    /// Apply the environment overrides on top of `base` and validate.
    pub fn to_run_config(&self, base: RunConfig) -> Result<RunConfig, ConfigError> {
        let mut run = base;
        if let Some(users) = self.users {
            run.target_concurrency = users;
        }
        if let Some(rate) = self.spawn_rate {
            run.spawn_rate = rate;
        }
        if self.test_duration.is_some() {
            run.duration = self.test_duration;
        }
        if self.wait_min.is_some() || self.wait_max.is_some() {
            run.wait_time = WaitTime::between(
                self.wait_min.unwrap_or(run.wait_time.min),
                self.wait_max.unwrap_or(run.wait_time.max),
            )?;
        }
        if let Some(timeout) = self.request_timeout {
            run.request_timeout = timeout;
        }
        if !self.hosts.is_empty() {
            run.hosts = self.hosts.iter().cloned().collect::<HashMap<_, _>>();
        }
        if !self.tags.is_empty() || !self.exclude_tags.is_empty() {
            run.tags = TagFilter::new(self.tags.iter().cloned(), self.exclude_tags.iter().cloned());
        }
        if self.random_seed.is_some() {
            run.seed = self.random_seed;
        }

        run.validate()?;
        Ok(run)
    }

    /// Creates a ClientConfig for the given run.
    pub fn to_client_config(&self, run: &RunConfig) -> ClientConfig {
        ClientConfig {
            // The per-action tokio timeout fires first.
            request_timeout: run.request_timeout + Duration::from_secs(1),
            skip_tls_verify: self.skip_tls_verify,
            custom_headers: self.custom_headers.clone(),
            ..ClientConfig::default()
        }
    }

    /// Prints the configuration summary.
    pub fn print_summary(
        &self,
        run: &RunConfig,
        user_types: &[(&str, &str)],
        parsed_headers: &reqwest::header::HeaderMap,
    ) {
        println!("Starting load test:");
        println!("  Plan file: {}", self.plan_file);
        println!("  Users: {}", run.target_concurrency);
        println!("  Spawn rate: {}/s", run.spawn_rate);
        match run.duration {
            Some(duration) => println!("  Test duration: {:?}", duration),
            None => println!("  Test duration: until stopped (Ctrl-C)"),
        }
        println!(
            "  Wait time: {:?} to {:?}",
            run.wait_time.min, run.wait_time.max
        );
        println!("  Request timeout: {:?}", run.request_timeout);
        if let Some(seed) = run.seed {
            println!("  Random seed: {}", seed);
        }
        println!("  User types:");
        for &(name, host) in user_types {
            let host = run.hosts.get(name).map(String::as_str).unwrap_or(host);
            println!("    {} -> {}", name, host);
        }
        if !self.tags.is_empty() {
            println!("  Tags: {}", self.tags.join(", "));
        }
        if !self.exclude_tags.is_empty() {
            println!("  Excluded tags: {}", self.exclude_tags.join(", "));
        }
        println!("  Skip TLS Verify: {}", self.skip_tls_verify);

        if parsed_headers.is_empty() {
            println!("  Custom Headers Enabled: No");
        } else {
            println!("  Custom Headers Enabled: Yes");
            for (name, value) in parsed_headers.iter() {
                println!(
                    "    {}: {}",
                    name,
                    value.to_str().unwrap_or("<non-ASCII or sensitive value>")
                );
            }
        }
    }
}
