//! Leased lock table for a single process.
//!
//! Each [`InMemoryLockClient`] is one holder; clients share the table they
//! were created from. A lease not released within its duration lapses and
//! the lock becomes free again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{LockClient, LockError};

#[derive(Debug, Clone, Copy)]
struct Lease {
    holder: Uuid,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct InMemoryLockTable {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    lease: Duration,
}

impl InMemoryLockTable {
    pub fn new(lease: Duration) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            lease,
        }
    }

    /// A new holder on this table.
    pub fn client(&self) -> InMemoryLockClient {
        InMemoryLockClient {
            table: self.clone(),
            holder: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryLockClient {
    table: InMemoryLockTable,
    holder: Uuid,
}

#[async_trait]
impl LockClient for InMemoryLockClient {
    async fn acquire(&self, name: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.table.leases.lock().await;
        if let Some(lease) = leases.get(name) {
            if lease.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            name.to_owned(),
            Lease {
                holder: self.holder,
                expires_at: now + self.table.lease,
            },
        );
        Ok(true)
    }

    /// Releasing a lock this holder does not own (never taken, or lapsed and
    /// taken by someone else) leaves the table untouched and succeeds.
    async fn release(&self, name: &str) -> Result<bool, LockError> {
        let mut leases = self.table.leases.lock().await;
        if leases.get(name).is_some_and(|l| l.holder == self.holder) {
            leases.remove(name);
        }
        Ok(true)
    }
}
