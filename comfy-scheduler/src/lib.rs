//! `comfy-scheduler`: a filesystem-driven job scheduler that drives a
//! local ComfyUI instance.
//!
//! Four pieces compose around a single SQLite-backed job store:
//! [`monitor`] ingests declarative YAML job configs from a processing
//! directory tree, [`store`] holds one row per known config with
//! lease-based ownership and retry accounting, [`executor`] leases a job,
//! binds its inputs into a workflow template, drives ComfyUI over HTTP +
//! WebSocket, and persists the outputs, and [`api`] exposes an HTTP control
//! surface over the store for operators.
//!
//! This crate knows nothing about books, chapters, images or videos — only
//! jobs, workflows and outputs. Producers (an audiobook pipeline or
//! anything else) write config files into the processing directory and
//! read job state back out through the store or the API.

pub mod api;
pub mod config;
pub mod executor;
pub mod fs_util;
pub mod monitor;
pub mod store;
pub mod types;
pub mod validation;

pub use config::{ConfigError, GlobalConfig};
pub use executor::JobExecutor;
pub use store::{JobOutcome, JobStoreError, SqliteStore, StoreResult, UpsertInput};
pub use types::{JobConfig, JobRecord, JobStatus, JobType, Priority, WorkflowCatalog, WorkflowDef};
pub use validation::ValidationError;
