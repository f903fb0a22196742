//! Container provisioning core for a CI/CD orchestrator.
//!
//! Given a unit of work that needs an isolated execution environment, berth
//! locates a compatible worker, finds or creates a container for the work's
//! owner on it, provisions the volumes the container needs, and hands back a
//! live [`worker::WorkerContainer`].
//!
//! The interesting parts live in [`worker`]: the compatibility matcher, the
//! mount planner, and the [`worker::ContainerProvider`] state machine that
//! reconciles the record store ([`db`]), the container runtime ([`runtime`])
//! and the volume service ([`volume`]) under concurrent callers, using the
//! lock service ([`lock`]) to elect a single creator per owner.

pub mod config;
pub mod db;
pub mod error;
pub mod image;
pub mod lock;
pub mod observability;
pub mod runtime;
pub mod volume;
pub mod worker;

pub use error::{Error, Result};
