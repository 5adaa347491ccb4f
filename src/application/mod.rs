use chrono::{DateTime, Utc};
use std::sync::Arc;

pub mod bootstrap;
pub mod calendar_gateway;
pub mod calendar_setup;
pub mod calendar_sync;
pub mod channels;
pub mod dispatcher;
pub mod engine;
pub mod fallback_scheduler;
pub mod jobs;
pub mod oauth;
pub mod transfer;

/// Clock seam shared by the services; tests inject a fixed clock.
pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
