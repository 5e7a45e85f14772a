//! Durable job queue for workspace lifecycle jobs
//!
//! Jobs are serialized to JSON and stored in named lists on a
//! [`QueueSubstrate`]. Dequeue moves one entry into a shared processing list
//! and leases it in a single broker operation, which gives at-least-once
//! delivery with a visible in-flight set. The lease lets a reaper recover jobs
//! left behind by a crashed worker; live workers renew it while they run.

pub mod error;
pub mod job;
pub mod keys;
pub mod memory;
pub mod queue;
pub mod rdb;
pub mod substrate;

pub use error::{QueueError, Result};
pub use job::{Job, JobKind, JobPayload};
pub use memory::MemorySubstrate;
pub use queue::{FailOptions, FailOutcome, JobQueue, QueueSettings};
pub use rdb::RedisSubstrate;
pub use substrate::QueueSubstrate;
