//! Job state listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use jobmanager_core::JobId;

/// Externally visible state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failure,
}

impl JobState {
    /// Terminal states; the job has left storage.
    pub fn is_complete(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }
}

/// Which jobs a listener hears about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    All,
    Id(JobId),
    FactoryKey(String),
    Queue(String),
}

impl JobFilter {
    fn matches(&self, update: &JobUpdate) -> bool {
        match self {
            JobFilter::All => true,
            JobFilter::Id(id) => &update.id == id,
            JobFilter::FactoryKey(key) => &update.factory_key == key,
            JobFilter::Queue(queue) => update.queue_key.as_ref() == Some(queue),
        }
    }
}

/// A state change delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub id: JobId,
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub state: JobState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&JobUpdate) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    entries: Vec<(ListenerId, JobFilter, Listener)>,
}

/// Fans job state changes out to registered listeners.
///
/// Cheap to clone; clones share listeners. Listeners run on the thread that
/// reported the change (the controller thread in a running engine) and must
/// not block.
#[derive(Clone, Default)]
pub struct JobTracker {
    listeners: Arc<Mutex<Listeners>>,
    next_id: Arc<AtomicU64>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&self, filter: JobFilter, listener: F) -> ListenerId
    where
        F: Fn(&JobUpdate) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .push((id, filter, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .retain(|(entry, _, _)| *entry != id);
    }

    pub fn on_state_change(&self, update: JobUpdate) {
        // Listeners are called outside the lock so they may add or remove
        // listeners themselves.
        let matching: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .filter(|(_, filter, _)| filter.matches(&update))
            .map(|(_, _, listener)| listener.clone())
            .collect();

        for listener in matching {
            listener(&update);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: &str, key: &str, queue: Option<&str>, state: JobState) -> JobUpdate {
        JobUpdate {
            id: JobId::from(id),
            factory_key: key.to_string(),
            queue_key: queue.map(str::to_string),
            state,
        }
    }

    #[test]
    fn filters_route_updates() {
        let tracker = JobTracker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for filter in [
            JobFilter::All,
            JobFilter::Id(JobId::from("a")),
            JobFilter::FactoryKey("Push".to_string()),
            JobFilter::Queue("q".to_string()),
        ] {
            let seen = seen.clone();
            let label = format!("{filter:?}");
            tracker.add_listener(filter, move |u| {
                seen.lock().unwrap().push((label.clone(), u.id.to_string()));
            });
        }

        tracker.on_state_change(update("a", "Other", None, JobState::Running));
        tracker.on_state_change(update("b", "Push", Some("q"), JobState::Success));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.iter().filter(|(_, id)| id == "a").count(), 2);
        assert_eq!(seen.iter().filter(|(_, id)| id == "b").count(), 3);
    }

    #[test]
    fn removed_listener_is_silent() {
        let tracker = JobTracker::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let id = tracker.add_listener(JobFilter::All, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.on_state_change(update("a", "J", None, JobState::Pending));
        tracker.remove_listener(id);
        tracker.on_state_change(update("a", "J", None, JobState::Running));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.listener_count(), 0);
    }

    #[test]
    fn complete_states() {
        assert!(JobState::Success.is_complete());
        assert!(JobState::Failure.is_complete());
        assert!(!JobState::Running.is_complete());
    }
}
