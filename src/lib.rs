//! # farm
//!
//! Polls workflow engines (Airflow, Argo Workflows), publishes one event per
//! observed state transition to Pub/Sub, and rebuilds a span tree for every
//! run that reaches a terminal state.
//!
//! The core is engine-agnostic: sources produce [`model::EntitySnapshot`]s,
//! the [`dedup`] cache decides what changed, [`event`] builds and publishes
//! the payload, and [`trace`] reconstructs the run's trace.

pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod event;
pub mod gcp;
pub mod identity;
pub mod model;
pub mod publish;
pub mod source;
pub mod telemetry;
pub mod trace;
