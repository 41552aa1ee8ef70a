//! Cross-instance mutual exclusion for maintenance jobs.
//!
//! Every job run follows the same shape:
//!
//! ```text
//! Idle -> acquire -> { Skipped | run body -> release (retried until it succeeds) -> Idle }
//! ```
//!
//! A body that fails or panics still reaches the release step, and its
//! failure never escapes [`run_under_lock`]. Locks are per job name.

pub mod memory;

pub use memory::{InMemoryLockClient, InMemoryLockTable};

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock backend failure: {0}")]
    Backend(String),
}

/// A named, leased lock shared by every instance of the fleet.
///
/// `acquire` answers `false` when another holder has the lock; that is a
/// normal outcome, not an error. `release` may answer `false` under backend
/// contention and should then be retried. A holder that dies keeps the lock
/// only until its lease expires.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockClient: Send + Sync {
    async fn acquire(&self, name: &str) -> Result<bool, LockError>;
    async fn release(&self, name: &str) -> Result<bool, LockError>;
}

/// Backoff between release attempts: doubles from `initial` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasePolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
        }
    }
}

/// How one scheduled run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The lock was held elsewhere (or could not be checked); nothing ran.
    Skipped,
    Completed,
    Failed(String),
}

/// Run `body` while holding the lock `name`.
pub async fn run_under_lock<F, Fut, E>(
    lock: &dyn LockClient,
    name: &str,
    policy: ReleasePolicy,
    body: F,
) -> JobOutcome
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    match lock.acquire(name).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(job = name, "lock held elsewhere, skipping run");
            return JobOutcome::Skipped;
        }
        Err(e) => {
            warn!(job = name, error = %e, "lock acquisition failed, skipping run");
            return JobOutcome::Skipped;
        }
    }

    info!(job = name, "job started");
    let outcome = match AssertUnwindSafe(async move { body().await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {
            info!(job = name, "job completed");
            JobOutcome::Completed
        }
        Ok(Err(e)) => {
            error!(job = name, error = %e, "job failed");
            JobOutcome::Failed(e.to_string())
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(job = name, reason = %reason, "job panicked");
            JobOutcome::Failed(reason)
        }
    };

    release_until_done(lock, name, policy).await;
    outcome
}

async fn release_until_done(lock: &dyn LockClient, name: &str, policy: ReleasePolicy) {
    let mut backoff = policy.initial;
    loop {
        match lock.release(name).await {
            Ok(true) => {
                debug!(job = name, "lock released");
                return;
            }
            Ok(false) => warn!(job = name, "lock release not acknowledged, retrying"),
            Err(e) => warn!(job = name, error = %e, "lock release failed, retrying"),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(policy.max);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_owned()
    }
}
