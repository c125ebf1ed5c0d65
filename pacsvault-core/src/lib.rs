//! # pacsvault core
//!
//! Processing core of the pacsvault image archive: it takes medical-image
//! objects that arrived from remote modalities, merges them into per-study
//! storage and keeps the fleet of storage filesystems healthy through
//! scheduled maintenance.
//!
//! ## Overview
//!
//! - **Maintenance dispatching**: scheduled service-lock entries are locked,
//!   run on a bounded worker pool and put back when their processor fails
//!   ([`service_lock`]).
//! - **Study ingestion**: pending objects of a work item are merged into
//!   their study, duplicates are compared, overwritten or parked for
//!   reconciliation ([`work_queue`]).
//! - **Transactional batches**: manifest and artifact changes happen through
//!   reversible command batches ([`command`]).
//! - **Store ports**: every persistent operation goes through the traits in
//!   [`database::ports`], with an in-memory adapter for tests and a Postgres
//!   adapter behind the `postgres` feature.
//!
//! ## Feature Flags
//!
//! - `postgres` (default): the sqlx-backed [`database::PostgresStore`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Operator alerts and sinks
pub mod alerts;

/// Image object seam and the reference codec
pub mod codec;

/// Reversible command batches
pub mod command;

/// Runtime configuration
pub mod config;

/// Store ports and adapters
pub mod database;

/// Error types
pub mod error;

/// Worker pool, dispatcher, registry and item processor base
pub mod processing;

/// Rules engine seam
pub mod rules;

/// Maintenance queue and processors
pub mod service_lock;

/// Study folder layout and manifests
pub mod storage;

/// Ingestion queue and the study processor
pub mod work_queue;

pub use error::{PacsError, Result};
