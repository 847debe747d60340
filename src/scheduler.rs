//! Weighted action selection and user-type distribution.
//!
//! [`WeightedSelector`] picks the next task of a task-set user: each eligible
//! action owns a slice of `[0, total_weight)` proportional to its weight and
//! a uniform draw from the caller's generator is binary-searched into the
//! cumulative partition. [`WeightedRoundRobin`] spreads newly spawned users
//! over user types deterministically in proportion to their weights.

use rand::Rng;
use std::collections::BTreeSet;
use tracing::debug;

use crate::action::Action;
use crate::errors::ConfigError;

/// Tag include/exclude filter applied when a selector is built.
///
/// An empty include set admits every action; exclusion always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
}

impl TagFilter {
    pub fn new<I, E, S, T>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    pub fn admits(&self, tags: &BTreeSet<String>) -> bool {
        if tags.iter().any(|t| self.exclude.contains(t)) {
            return false;
        }
        self.include.is_empty() || tags.iter().any(|t| self.include.contains(t))
    }
}

/// Chooses among a fixed set of actions proportionally to their weights.
///
/// # Example
/// ```
/// use rand::SeedableRng;
/// use swarm_loadtest::action::{Action, HttpAction};
/// use swarm_loadtest::scheduler::{TagFilter, WeightedSelector};
///
/// let actions = vec![
///     Action::new("list", HttpAction::get("/api/products").unwrap()).with_weight(3),
///     Action::new("health", HttpAction::get("/health").unwrap()),
/// ];
/// let selector = WeightedSelector::new("ProductUser", actions, &TagFilter::default()).unwrap();
///
/// let mut rng = rand::rngs::StdRng::seed_from_u64(42);
/// let action = selector.select(&mut rng);
/// // 75% chance of "list", 25% chance of "health"
/// # let _ = action;
/// ```
#[derive(Debug, Clone)]
pub struct WeightedSelector {
    actions: Vec<Action>,
    cumulative_weights: Vec<u64>,
    total_weight: u64,
}

impl WeightedSelector {
    /// Build a selector over the actions admitted by `filter`.
    ///
    /// `owner` names the user type in error messages. Fails when no action is
    /// eligible, when an eligible action has weight zero, or when the total
    /// weight is zero.
    pub fn new(
        owner: &str,
        actions: Vec<Action>,
        filter: &TagFilter,
    ) -> Result<Self, ConfigError> {
        let actions: Vec<Action> = actions
            .into_iter()
            .filter(|a| filter.admits(a.tags()))
            .collect();

        if actions.is_empty() {
            return Err(ConfigError::NoEligibleActions(owner.to_string()));
        }

        let mut cumulative = Vec::with_capacity(actions.len());
        let mut sum: u64 = 0;
        for action in &actions {
            if action.weight() == 0 {
                return Err(ConfigError::ZeroWeight(format!(
                    "{}.{}",
                    owner,
                    action.name()
                )));
            }
            sum += u64::from(action.weight());
            cumulative.push(sum);
        }

        if sum == 0 {
            return Err(ConfigError::ZeroTotalWeight(owner.to_string()));
        }

        debug!(
            user_type = owner,
            actions = actions.len(),
            total_weight = sum,
            "Built weighted selector"
        );

        Ok(Self {
            actions,
            cumulative_weights: cumulative,
            total_weight: sum,
        })
    }

    /// Select an action. O(log n).
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> &Action {
        let draw = rng.gen_range(0..self.total_weight);
        // First cumulative weight strictly greater than the draw.
        let index = self.cumulative_weights.partition_point(|w| *w <= draw);
        &self.actions[index]
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Selection probability of each eligible action.
    pub fn probabilities(&self) -> Vec<(String, f64)> {
        self.actions
            .iter()
            .map(|a| {
                (
                    a.name().to_string(),
                    f64::from(a.weight()) / self.total_weight as f64,
                )
            })
            .collect()
    }
}

/// Smooth weighted round-robin over user types.
///
/// Over any window of `Σweights` consecutive picks every type is chosen
/// exactly `weight` times, and picks of the same type are spread out rather
/// than clustered.
#[derive(Debug, Clone)]
pub struct WeightedRoundRobin {
    entries: Vec<(String, i64, i64)>,
    total: i64,
}

impl WeightedRoundRobin {
    pub fn new<I, S>(weights: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut entries = Vec::new();
        for (name, weight) in weights {
            let name = name.into();
            if weight == 0 {
                return Err(ConfigError::ZeroWeight(name));
            }
            entries.push((name, i64::from(weight), 0));
        }
        if entries.is_empty() {
            return Err(ConfigError::NoUserTypes);
        }
        let total = entries.iter().map(|(_, w, _)| *w).sum();
        Ok(Self { entries, total })
    }

    /// Name of the next user type to spawn.
    pub fn next(&mut self) -> &str {
        let mut best = 0;
        for i in 0..self.entries.len() {
            self.entries[i].2 += self.entries[i].1;
            if self.entries[i].2 > self.entries[best].2 {
                best = i;
            }
        }
        self.entries[best].2 -= self.total;
        &self.entries[best].0
    }
}
