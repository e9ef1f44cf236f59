//! # Purser
//!
//! The server-side engine of a shipboard research-vessel data manager.
//!
//! A fleet of long-running worker processes subscribes to named job queues on
//! a central broker, pulls data from heterogeneous acquisition systems into a
//! canonical cruise directory, keeps derivative indices (MD5 summary,
//! data-dashboard manifest) consistent with the cruise tree, and replicates
//! the assembled cruise outward to shore and archival destinations.
//!
//! ## Pipeline
//!
//! 1. The scheduler ([`scheduler`]) and the shoreside UI submit jobs to the
//!    broker ([`broker`]).
//! 2. A [`worker::WorkerRuntime`] receives each job, resolves the owning task
//!    record through the control plane ([`api`]), and dispatches to a handler
//!    in [`handlers`].
//! 3. Handlers move bytes with the transfer executor ([`executor`]) fed by
//!    the file-list builder ([`filelist`]) and the connection primitives
//!    ([`connection`]).
//! 4. Completion publishes a [`types::JobReport`]; a `Pass` verdict chains
//!    the configured follow-on jobs.
//!
//! ## Modules
//!
//! - [`types`] — domain records, job reports, tagged payloads
//! - [`config`] — `purser.toml` loading and merging
//! - [`api`] — typed control-plane client
//! - [`broker`] — job-broker protocol client and worker session
//! - [`filters`] — token substitution and include/exclude/ignore globs
//! - [`connection`] — SMB/SSH/rsync probes and command builders
//! - [`filelist`] — source enumeration and classification
//! - [`executor`] — transfer subprocess driver with progress parsing
//! - [`fsutil`] — directory creation, ownership, purging, atomic writes
//! - [`md5`] — MD5 summary index
//! - [`dashboard`] — data-dashboard manifest index
//! - [`lock`] — per-cruise index lock
//! - [`worker`] — job lifecycle runtime
//! - [`handlers`] — concrete task procedures
//! - [`scheduler`] / [`size_cacher`] — time-triggered submitters

pub mod api;
pub mod broker;
pub mod config;
pub mod connection;
pub mod dashboard;
pub mod executor;
pub mod filelist;
pub mod filters;
pub mod fsutil;
pub mod handlers;
pub mod lock;
pub mod md5;
pub mod scheduler;
pub mod size_cacher;
pub mod types;
pub mod worker;

/// Timedelta-phrase parsing, re-exported from the purser-duration microcrate.
pub use purser_duration as duration;
