//! Usage metering for hosted workspaces
//!
//! Turns "resource X was active during slot Y" observations into usage events
//! that are billed exactly once, forwards them to the payment processor and
//! raises billing alerts as users approach their plan limits.

pub mod alerts;
pub mod error;
pub mod event;
pub mod meter;
pub mod processor;
pub mod subscription;

pub use alerts::{AlertStore, AlertType, BillingAlert, NewAlert};
pub use error::{MeteringError, Result};
pub use event::{idempotency_key, EventType, MeteringReport, SyncReport, SyncStatus, UsageEvent};
pub use meter::UsageMeter;
pub use processor::{HttpMeteringProcessor, MeteringProcessor, UsageSubmission};
pub use subscription::{Subscription, SubscriptionStore, UpsertSubscription};
