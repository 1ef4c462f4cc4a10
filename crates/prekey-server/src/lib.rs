//! X3DH prekey bundle server.
//!
//! Stores each user's identity key, signed prekey and pool of one-time
//! prekeys, and hands one-time prekeys out exactly once, oldest first.
//!
//! # Architecture
//!
//! - [`storage`]: the [`KeyStore`] trait and its backends. All concurrency
//!   guarantees (exactly-once consumption, all-or-nothing writes) live here.
//! - [`BundleService`]: request validation, signature checks and envelope
//!   sealing of private keys before anything reaches the store.
//! - [`OpkMonitor`]: periodic scan for users running low on one-time
//!   prekeys.
//! - [`AuditSink`]: best-effort audit trail of bundle fetches, refills and
//!   rejected signatures.
//!
//! Time enters through [`Clock`], deadlines and cancellation through
//! [`OpContext`], so every component runs deterministically under test.
//!
//! # Components
//!
//! - [`MemoryStorage`]: in-process store with per-user locks
//! - [`RedbStorage`]: durable store on redb, one process at a time
//! - [`SqliteStorage`]: durable store on SQLite, shared between processes
//! - [`ChaoticStorage`]: fault injection wrapper for chaos tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod audit;
mod bundle_service;
mod clock;
mod config;
mod context;
mod error;
mod opk_monitor;
pub mod storage;

pub use audit::{
    AuditAction, AuditDetail, AuditError, AuditEvent, AuditSink, AuditStatus, BundleStep, NoAudit,
};
pub use bundle_service::{
    BundleService, OneTimePreKeyUpload, PreKeyBundle, PublishedOneTimePreKey, RegisterBundle,
    RotateSignedPreKey,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ServiceConfig;
pub use context::{CancelToken, OpContext};
pub use error::{BundleError, KeyKind};
pub use opk_monitor::{LowPool, MonitorStats, OpkMonitor};
pub use storage::{
    ChaoticStorage, Consumption, KeyStore, Lookup, MemoryStorage, RedbStorage, SqliteStorage,
    StorageError,
};
