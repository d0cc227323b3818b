//! `jobmanager-core`: persisted data model of the job engine.
//!
//! This crate contains **pure data** types (no storage or threading concerns):
//! the rows that make up a durable job and the validation rules they obey.

pub mod error;
pub mod id;
pub mod spec;
pub mod time;

pub use error::{SpecError, SpecResult};
pub use id::JobId;
pub use spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec, MIGRATION_QUEUE_KEY};
pub use time::{EpochMillis, now_millis};
