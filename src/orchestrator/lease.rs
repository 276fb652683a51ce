//! Per-(engine, scope) batch leases.
//!
//! A lease marks a batch as in flight. It is released when its guard is
//! dropped and lapses on its own after the TTL, so a crashed holder cannot
//! block a scope forever.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::{EngineKind, KeepAlive};
use crate::error::{Error, Result};
use crate::memory::Scope;

/// What a lease protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseKey {
    pub engine: EngineKind,
    pub scope: Scope,
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    token: Uuid,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

type Leases = Arc<Mutex<HashMap<LeaseKey, LeaseEntry>>>;

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| Error::invalid_config(format!("lease ttl {} overflows the clock", ttl)))
}

fn lock(leases: &Leases) -> MutexGuard<'_, HashMap<LeaseKey, LeaseEntry>> {
    leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Table of live leases.
#[derive(Clone)]
pub struct LeaseTable {
    leases: Leases,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl LeaseTable {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            clock,
        }
    }

    /// Take the lease for `(engine, scope)`.
    ///
    /// Fails with [`Error::BatchInProgress`] while an unexpired lease is held.
    pub fn try_acquire(&self, engine: EngineKind, scope: &Scope) -> Result<LeaseGuard> {
        let now = self.clock.now();
        let key = LeaseKey {
            engine,
            scope: scope.clone(),
        };
        let expires_at = expiry(now, self.ttl)?;
        let mut leases = lock(&self.leases);
        if let Some(existing) = leases.get(&key) {
            if existing.expires_at > now {
                debug!(engine = %engine, scope = %scope, "Lease already held");
                return Err(Error::batch_in_progress(engine, scope));
            }
            warn!(
                engine = %engine,
                scope = %scope,
                acquired_at = %existing.acquired_at,
                "Taking over expired lease"
            );
        }

        let entry = LeaseEntry {
            token: Uuid::new_v4(),
            acquired_at: now,
            expires_at,
        };
        let guard = LeaseGuard {
            leases: self.leases.clone(),
            key: key.clone(),
            token: entry.token,
            ttl: self.ttl,
            clock: self.clock.clone(),
        };
        leases.insert(key, entry);
        Ok(guard)
    }

    /// Whether an unexpired lease exists.
    pub fn is_held(&self, engine: EngineKind, scope: &Scope) -> bool {
        let now = self.clock.now();
        let key = LeaseKey {
            engine,
            scope: scope.clone(),
        };
        lock(&self.leases)
            .get(&key)
            .map(|e| e.expires_at > now)
            .unwrap_or(false)
    }

    /// Keys of all unexpired leases, sorted by engine then scope.
    pub fn held(&self) -> Vec<LeaseKey> {
        let now = self.clock.now();
        let mut keys: Vec<LeaseKey> = lock(&self.leases)
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort_by(|a, b| a.engine.cmp(&b.engine).then_with(|| a.scope.cmp(&b.scope)));
        keys
    }
}

/// Proof of holding a lease; releases it on drop.
pub struct LeaseGuard {
    leases: Leases,
    key: LeaseKey,
    token: Uuid,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl LeaseGuard {
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    /// Extend the lease by one TTL from now.
    ///
    /// Fails if the lease lapsed and was taken over by someone else.
    pub fn renew(&self) -> Result<DateTime<Utc>> {
        let expires_at = expiry(self.clock.now(), self.ttl)?;
        let mut leases = lock(&self.leases);
        match leases.get_mut(&self.key) {
            Some(entry) if entry.token == self.token => {
                entry.expires_at = expires_at;
                Ok(entry.expires_at)
            }
            _ => Err(Error::batch_in_progress(self.key.engine, &self.key.scope)),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.leases)
            .get(&self.key)
            .filter(|e| e.token == self.token)
            .map(|e| e.expires_at)
    }
}

impl KeepAlive for LeaseGuard {
    fn renew(&self) -> Result<()> {
        LeaseGuard::renew(self).map(|_| ())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut leases = lock(&self.leases);
        if leases.get(&self.key).map(|e| e.token) == Some(self.token) {
            leases.remove(&self.key);
        }
    }
}
