//! Worker service for the workspace lifecycle
//!
//! Runs queued provision/destroy jobs through the orchestrators, reaps
//! stranded reservations, and exposes the operator CLI used by schedulers
//! for metering and usage sync.

pub mod cli;
pub mod config;
pub mod reaper;
pub mod services;
pub mod worker;

pub use config::Config;
pub use reaper::{start_reaper_task, ReapReport, Reaper};
pub use worker::{start_worker_task, JobReport, JobResult, Processed, Worker};
