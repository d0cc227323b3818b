//! Host wake-up scheduling.
//!
//! The engine runs its own timers while the process is alive. A [`Scheduler`]
//! is the host's facility for waking the process later (an alarm, a system
//! job scheduler, a cron entry) so that pending work still runs if the process
//! is suspended in the meantime.

use std::sync::Arc;
use std::time::Duration;

/// Best-effort request for a future wake-up.
pub trait Scheduler: Send + Sync {
    /// Wake the engine no sooner than `delay` from now. `constraint_keys` is
    /// the sorted union of constraints required by pending jobs, for hosts
    /// that can defer until those hold.
    fn schedule(&self, delay: Duration, constraint_keys: &[String]);
}

impl<T: Scheduler + ?Sized> Scheduler for Arc<T> {
    fn schedule(&self, delay: Duration, constraint_keys: &[String]) {
        (**self).schedule(delay, constraint_keys)
    }
}

/// For hosts with no wake facility.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn schedule(&self, _delay: Duration, _constraint_keys: &[String]) {}
}

/// Fans a request out to several schedulers.
#[derive(Default, Clone)]
pub struct CompositeScheduler {
    schedulers: Vec<Arc<dyn Scheduler>>,
}

impl CompositeScheduler {
    pub fn new(schedulers: Vec<Arc<dyn Scheduler>>) -> Self {
        Self { schedulers }
    }

    pub fn with(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.schedulers.push(scheduler);
        self
    }
}

impl Scheduler for CompositeScheduler {
    fn schedule(&self, delay: Duration, constraint_keys: &[String]) {
        for scheduler in &self.schedulers {
            scheduler.schedule(delay, constraint_keys);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingScheduler;
    use super::*;

    #[test]
    fn composite_fans_out() {
        let first = Arc::new(RecordingScheduler::default());
        let second = Arc::new(RecordingScheduler::default());
        let composite = CompositeScheduler::default()
            .with(first.clone())
            .with(second.clone());

        composite.schedule(Duration::from_secs(5), &["Network".to_string()]);

        assert_eq!(first.requests().len(), 1);
        assert_eq!(
            second.last(),
            Some((Duration::from_secs(5), vec!["Network".to_string()]))
        );
    }
}
