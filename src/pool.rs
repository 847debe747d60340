//! The user pool controller: spawns virtual users at a controlled rate and
//! retires them on stop.
//!
//! Everything that can be misconfigured is checked in [`UserPool::start`]
//! before the first user exists: run parameters, every user type's action
//! set or journey, host overrides. After that the controller task only
//! spawns, holds and joins.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info};

use crate::action::Action;
use crate::errors::ConfigError;
use crate::journey::{Journey, JourneyMachine};
use crate::metrics::{LIVE_USERS, LIVE_USERS_BY_TYPE};
use crate::scheduler::{TagFilter, WeightedRoundRobin, WeightedSelector};
use crate::stats::StatsAggregator;
use crate::transport::TransportFactory;
use crate::user::{stopped, Behavior, UserSummary, VirtualUser, WaitTime};

/// What a user type does, as registered.
#[derive(Debug, Clone)]
pub enum UserBehavior {
    Tasks(Vec<Action>),
    Journey(Journey),
}

/// A class of simulated users.
#[derive(Debug, Clone)]
pub struct UserType {
    pub host: String,
    /// Relative share of spawned users.
    pub weight: u32,
    /// Overrides the run-wide wait time.
    pub wait_time: Option<WaitTime>,
    pub behavior: UserBehavior,
    pub on_start: Option<Action>,
    pub on_stop: Option<Action>,
}

impl UserType {
    pub fn tasks(host: impl Into<String>, actions: Vec<Action>) -> Self {
        Self::with_behavior(host, UserBehavior::Tasks(actions))
    }

    pub fn journey(host: impl Into<String>, journey: Journey) -> Self {
        Self::with_behavior(host, UserBehavior::Journey(journey))
    }

    fn with_behavior(host: impl Into<String>, behavior: UserBehavior) -> Self {
        Self {
            host: host.into(),
            weight: 1,
            wait_time: None,
            behavior,
            on_start: None,
            on_stop: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_wait_time(mut self, wait_time: WaitTime) -> Self {
        self.wait_time = Some(wait_time);
        self
    }

    pub fn with_on_start(mut self, action: Action) -> Self {
        self.on_start = Some(action);
        self
    }

    pub fn with_on_stop(mut self, action: Action) -> Self {
        self.on_stop = Some(action);
        self
    }
}

/// The registered user types of a run, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TestPlan {
    user_types: BTreeMap<String, UserType>,
}

impl TestPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_type(mut self, name: impl Into<String>, user_type: UserType) -> Self {
        self.add_user_type(name, user_type);
        self
    }

    pub fn add_user_type(&mut self, name: impl Into<String>, user_type: UserType) {
        self.user_types.insert(name.into(), user_type);
    }

    pub fn user_types(&self) -> &BTreeMap<String, UserType> {
        &self.user_types
    }

    pub fn user_type(&self, name: &str) -> Option<&UserType> {
        self.user_types.get(name)
    }
}

/// Run parameters. Immutable once the run starts.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target_concurrency: usize,
    /// Users spawned per second.
    pub spawn_rate: f64,
    /// `None` runs until stopped.
    pub duration: Option<Duration>,
    pub wait_time: WaitTime,
    pub request_timeout: Duration,
    /// Per user type host overrides.
    pub hosts: HashMap<String, String>,
    pub tags: TagFilter,
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_concurrency: 1,
            spawn_rate: 1.0,
            duration: None,
            wait_time: WaitTime::default(),
            request_timeout: Duration::from_secs(30),
            hosts: HashMap::new(),
            tags: TagFilter::default(),
            seed: None,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidRunConfig(msg));

        if self.target_concurrency == 0 {
            return invalid("target concurrency must be greater than 0".to_string());
        }
        if !self.spawn_rate.is_finite() || self.spawn_rate <= 0.0 {
            return invalid(format!(
                "spawn rate must be a positive number, got {}",
                self.spawn_rate
            ));
        }
        let ramp_end = self
            .spawn_offset(self.target_concurrency)
            .and_then(|ramp| Instant::now().checked_add(ramp));
        if ramp_end.is_none() {
            return invalid(format!(
                "spawn rate {} is too low to spawn {} users",
                self.spawn_rate, self.target_concurrency
            ));
        }
        if let Some(duration) = self.duration {
            if duration.is_zero() {
                return invalid("duration must be greater than 0".to_string());
            }
            if Instant::now().checked_add(duration).is_none() {
                return invalid(format!("duration {:?} is out of range", duration));
            }
        }
        if self.request_timeout.is_zero() {
            return invalid("request timeout must be greater than 0".to_string());
        }
        if self.wait_time.min > self.wait_time.max {
            return invalid(format!(
                "wait time minimum {:?} exceeds maximum {:?}",
                self.wait_time.min, self.wait_time.max
            ));
        }
        Ok(())
    }

    /// Scheduled spawn offset of user `k` (1-based), `None` when it does
    /// not fit a `Duration`.
    pub fn spawn_offset(&self, k: usize) -> Option<Duration> {
        Duration::try_from_secs_f64(k as f64 / self.spawn_rate).ok()
    }
}

/// A user type with its behaviour built and validated.
struct PreparedUserType {
    host: String,
    wait_time: WaitTime,
    behavior: Behavior,
    on_start: Option<Action>,
    on_stop: Option<Action>,
}

fn prepare_user_types(
    plan: &TestPlan,
    config: &RunConfig,
) -> Result<BTreeMap<String, PreparedUserType>, ConfigError> {
    if plan.user_types.is_empty() {
        return Err(ConfigError::NoUserTypes);
    }
    for name in config.hosts.keys() {
        if !plan.user_types.contains_key(name) {
            return Err(ConfigError::UnknownUserType(name.clone()));
        }
    }

    let mut prepared = BTreeMap::new();
    for (name, user_type) in &plan.user_types {
        let host = config
            .hosts
            .get(name)
            .unwrap_or(&user_type.host)
            .trim_end_matches('/')
            .to_string();
        if !host.starts_with("http://") && !host.starts_with("https://") {
            return Err(ConfigError::InvalidRunConfig(format!(
                "host '{}' of user type '{}' must start with http:// or https://",
                host, name
            )));
        }

        let wait_time = user_type.wait_time.unwrap_or(config.wait_time);
        if wait_time.min > wait_time.max {
            return Err(ConfigError::InvalidRunConfig(format!(
                "wait time of user type '{}' has minimum above maximum",
                name
            )));
        }

        let behavior = match &user_type.behavior {
            UserBehavior::Tasks(actions) => {
                Behavior::Tasks(WeightedSelector::new(name, actions.clone(), &config.tags)?)
            }
            UserBehavior::Journey(journey) => {
                Behavior::Journey(JourneyMachine::new(Arc::new(journey.clone())))
            }
        };

        prepared.insert(
            name.clone(),
            PreparedUserType {
                host,
                wait_time,
                behavior,
                on_start: user_type.on_start.clone(),
                on_stop: user_type.on_stop.clone(),
            },
        );
    }
    Ok(prepared)
}

/// Decrements the live-user counters when a user task ends, even by panic.
struct LiveGuard {
    live: Arc<AtomicUsize>,
    user_type: String,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        LIVE_USERS.dec();
        LIVE_USERS_BY_TYPE
            .with_label_values(&[self.user_type.as_str()])
            .dec();
    }
}

/// Handle to a running load test.
///
/// Cheap to clone; every clone controls the same run.
#[derive(Clone)]
pub struct RunHandle {
    cancel: Arc<watch::Sender<bool>>,
    done: watch::Receiver<bool>,
    live: Arc<AtomicUsize>,
    spawned: Arc<AtomicUsize>,
    spawn_failures: Arc<AtomicUsize>,
    summaries: Arc<Mutex<Vec<UserSummary>>>,
    aggregator: StatsAggregator,
}

impl RunHandle {
    /// Cancel every user and wait until all of them have terminated.
    ///
    /// Idempotent: repeated or concurrent calls wait for the same teardown.
    pub async fn stop(&self) {
        if !self.cancel.send_replace(true) {
            info!("Stopping load test");
        }
        self.wait().await;
    }

    /// Wait for the run to end (duration elapsed or stopped).
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Users currently running.
    pub fn live_users(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Users spawned since the start.
    pub fn spawned_users(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Spawn slots lost because no transport could be created.
    pub fn spawn_failures(&self) -> usize {
        self.spawn_failures.load(Ordering::SeqCst)
    }

    pub fn aggregator(&self) -> &StatsAggregator {
        &self.aggregator
    }

    /// Summaries of the users that have terminated.
    pub fn summaries(&self) -> Vec<UserSummary> {
        self.summaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct UserPool;

impl UserPool {
    /// Validate everything and start the controller task.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        plan: &TestPlan,
        config: RunConfig,
        transports: Arc<dyn TransportFactory>,
        aggregator: StatsAggregator,
    ) -> Result<RunHandle, ConfigError> {
        config.validate()?;
        let user_types = prepare_user_types(plan, &config)?;
        let distributor = WeightedRoundRobin::new(
            plan.user_types
                .iter()
                .map(|(name, user_type)| (name.clone(), user_type.weight)),
        )?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let handle = RunHandle {
            cancel: Arc::new(cancel_tx),
            done: done_rx,
            live: Arc::new(AtomicUsize::new(0)),
            spawned: Arc::new(AtomicUsize::new(0)),
            spawn_failures: Arc::new(AtomicUsize::new(0)),
            summaries: Arc::new(Mutex::new(Vec::new())),
            aggregator,
        };

        info!(
            target_concurrency = config.target_concurrency,
            spawn_rate = config.spawn_rate,
            duration_secs = config.duration.map(|d| d.as_secs_f64()),
            user_types = user_types.len(),
            seed = config.seed,
            "Starting load test"
        );

        let controller = Controller {
            config,
            user_types,
            distributor,
            transports,
            handle: handle.clone(),
            cancel: cancel_rx,
            started: Instant::now(),
        };
        tokio::spawn(async move {
            controller.run().await;
            done_tx.send_replace(true);
        });

        Ok(handle)
    }
}

struct Controller {
    config: RunConfig,
    user_types: BTreeMap<String, PreparedUserType>,
    distributor: WeightedRoundRobin,
    transports: Arc<dyn TransportFactory>,
    handle: RunHandle,
    cancel: watch::Receiver<bool>,
    started: Instant,
}

impl Controller {
    async fn run(mut self) {
        let deadline = self
            .config
            .duration
            .and_then(|d| self.started.checked_add(d));
        let mut users = JoinSet::new();

        for k in 1..=self.config.target_concurrency {
            let Some(at) = self
                .config
                .spawn_offset(k)
                .and_then(|offset| self.started.checked_add(offset))
            else {
                error!(user_id = k, "Spawn instant out of range, ending ramp-up");
                break;
            };
            if deadline.is_some_and(|d| at >= d) {
                break;
            }
            tokio::select! {
                _ = time::sleep_until(at) => {}
                _ = stopped(&mut self.cancel) => break,
            }
            self.spawn_user(k, &mut users);
        }

        if self.handle.spawned_users() > 0 {
            info!(
                spawned = self.handle.spawned_users(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "Ramp-up complete"
            );
        }

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = time::sleep_until(deadline) => {
                        info!("Test duration elapsed, stopping users");
                        self.handle.cancel.send_replace(true);
                    }
                    _ = stopped(&mut self.cancel) => {}
                }
            }
            None => {
                stopped(&mut self.cancel).await;
            }
        }

        while let Some(joined) = users.join_next().await {
            match joined {
                Ok(summary) => self
                    .handle
                    .summaries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(summary),
                Err(e) => error!(error = %e, "Virtual user task failed"),
            }
        }
        info!(
            users = self.handle.spawned_users(),
            spawn_failures = self.handle.spawn_failures(),
            "All virtual users stopped"
        );
    }

    fn spawn_user(&mut self, user_id: usize, users: &mut JoinSet<UserSummary>) {
        let live = self.handle.live_users();
        if live >= self.config.target_concurrency {
            error!(
                user_id,
                live_users = live,
                target_concurrency = self.config.target_concurrency,
                "Refusing to spawn beyond target concurrency"
            );
            debug_assert!(false, "live users would exceed target concurrency");
            return;
        }

        let type_name = self.distributor.next().to_string();
        let Some(user_type) = self.user_types.get(&type_name) else {
            error!(user_type = %type_name, "Distributor produced an unknown user type");
            return;
        };
        let transport = match self.transports.create(user_id) {
            Ok(transport) => transport,
            Err(e) => {
                let failures = self.handle.spawn_failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    user_id,
                    user_type = %type_name,
                    spawn_failures = failures,
                    error = %e,
                    "Failed to create transport, user not spawned"
                );
                return;
            }
        };

        let user = VirtualUser::new(
            user_id,
            type_name.clone(),
            user_type.host.clone(),
            user_type.behavior.clone(),
            transport,
            self.handle.aggregator.clone(),
        )
        .with_wait_time(user_type.wait_time)
        .with_request_timeout(self.config.request_timeout)
        .with_seed(self.config.seed)
        .with_hooks(user_type.on_start.clone(), user_type.on_stop.clone());

        self.handle.live.fetch_add(1, Ordering::SeqCst);
        self.handle.spawned.fetch_add(1, Ordering::SeqCst);
        LIVE_USERS.inc();
        LIVE_USERS_BY_TYPE
            .with_label_values(&[type_name.as_str()])
            .inc();
        debug!(user_id, user_type = %type_name, "Spawned virtual user");

        let guard = LiveGuard {
            live: self.handle.live.clone(),
            user_type: type_name,
        };
        let cancel = self.cancel.clone();
        users.spawn(async move {
            let _guard = guard;
            user.run(cancel).await
        });
    }
}
