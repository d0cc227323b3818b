//! Constraints gate job eligibility; observers push "re-check now" wake-ups.
//!
//! The controller never polls constraints on a timer. It evaluates
//! `Constraint::is_met()` during a drain pass, and drain passes only happen
//! when a job is added, a job finishes, a retry comes due, or a
//! [`Notifier`] fires.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

/// A named, stateless predicate evaluated at dispatch time.
///
/// `is_met()` must be fast and must not block: it runs on the controller
/// thread.
pub trait Constraint: Send + Sync {
    /// Key stored in `ConstraintSpec::factory_key`.
    fn key(&self) -> &str;

    fn is_met(&self) -> bool;
}

/// Watches system state and fires the notifier when a constraint may have
/// become met.
pub trait ConstraintObserver: Send + Sync {
    fn register(&self, notifier: Notifier);
}

/// Handle used by observers to wake the controller.
///
/// Cheap to clone and safe to call from any thread; the wake-up is queued onto
/// the controller thread.
#[derive(Clone)]
pub struct Notifier {
    wake: Arc<dyn Fn(&str) + Send + Sync>,
}

impl Notifier {
    pub fn from_fn<F>(wake: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            wake: Arc::new(wake),
        }
    }

    pub fn on_constraint_met(&self, reason: &str) {
        (self.wake)(reason);
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

/// Result of checking a job's constraint keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintCheck {
    Met,
    Unmet,
    /// No constraint is registered under this key.
    Unknown(String),
}

/// Registry of constraints by key, built at startup and owned by the controller.
#[derive(Default, Clone)]
pub struct ConstraintRegistry {
    constraints: HashMap<String, Arc<dyn Constraint>>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constraint under its own key, replacing any previous one.
    pub fn register(&mut self, constraint: Arc<dyn Constraint>) {
        self.constraints
            .insert(constraint.key().to_string(), constraint);
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Constraint>> {
        self.constraints.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constraints.contains_key(key)
    }

    /// All keys must be registered and met. Unknown keys win over unmet ones.
    pub fn check<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> ConstraintCheck {
        let mut result = ConstraintCheck::Met;
        for key in keys {
            match self.constraints.get(key) {
                None => return ConstraintCheck::Unknown(key.to_string()),
                Some(c) if !c.is_met() => result = ConstraintCheck::Unmet,
                Some(_) => {}
            }
        }
        result
    }
}

impl fmt::Debug for ConstraintRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.constraints.keys().collect();
        keys.sort();
        f.debug_struct("ConstraintRegistry")
            .field("keys", &keys)
            .finish()
    }
}

/// A constraint backed by a flag that host code flips, e.g. "network
/// connected" from a platform callback or "one-time migration complete".
///
/// It is its own observer: flipping the flag from unmet to met notifies every
/// registered notifier.
#[derive(Debug)]
pub struct FlagConstraint {
    key: String,
    met: AtomicBool,
    notifiers: Mutex<Vec<Notifier>>,
}

impl FlagConstraint {
    pub fn new(key: impl Into<String>, initially_met: bool) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            met: AtomicBool::new(initially_met),
            notifiers: Mutex::new(Vec::new()),
        })
    }

    /// Update the flag. Only the unmet → met transition wakes the controller.
    pub fn set(&self, met: bool) {
        let was_met = self.met.swap(met, Ordering::SeqCst);
        if met && !was_met {
            debug!(constraint = %self.key, "constraint became met");
            let notifiers = self
                .notifiers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for notifier in notifiers {
                notifier.on_constraint_met(&self.key);
            }
        }
    }
}

impl Constraint for FlagConstraint {
    fn key(&self) -> &str {
        &self.key
    }

    fn is_met(&self) -> bool {
        self.met.load(Ordering::SeqCst)
    }
}

impl ConstraintObserver for FlagConstraint {
    fn register(&self, notifier: Notifier) {
        self.notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notifier);
    }
}
