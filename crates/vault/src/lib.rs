//! `sdb-vault` core: access-controlled, versioned secret storage under
//! envelope encryption, with the maintenance jobs that keep master keys and
//! data keys healthy.
//!
//! Layers, bottom up:
//! - [`arn`] and [`principal`] normalise who is calling.
//! - [`permission`] resolves the caller's role in an SDB.
//! - [`crypto`], [`kms`] and [`keys`] handle envelopes and master-key lifecycle.
//! - [`store`] and [`sdb`] persist secrets and safe deposit boxes through
//!   the [`repository`] traits.
//! - [`service`] puts permission checks and [`audit`] facts in front of it all.
//! - [`lock`] and [`jobs`] run maintenance across a fleet.

pub mod arn;
pub mod audit;
pub mod aws;
pub mod config;
pub mod crypto;
pub mod error;
pub mod jobs;
pub mod keys;
pub mod kms;
pub mod lock;
pub mod permission;
pub mod principal;
pub mod repository;
pub mod sdb;
pub mod service;
pub mod store;
pub mod telemetry;

pub use error::VaultError;
