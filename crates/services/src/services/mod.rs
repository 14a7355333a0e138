//! Migration engine services.
//!
//! The orchestrator drives everything else:
//!
//! - [`plan`] orders entities by their dependencies
//! - [`validation`] runs the pre- and post-migration gates
//! - [`batch_processor`] pages through one entity via [`cursor`] and [`transform`]
//! - [`rollback`] undoes a run with one of four strategies
//! - [`progress_monitor`] samples the session concurrently and raises alerts
//!
//! Every component reports through the [`events::EventBus`]; finished runs are
//! persisted by [`report::ReportWriter`].

pub mod batch_processor;
pub mod config;
pub mod cursor;
pub mod events;
pub mod orchestrator;
pub mod plan;
pub mod progress_monitor;
pub mod report;
pub mod rollback;
pub mod session;
pub mod transform;
pub mod validation;
