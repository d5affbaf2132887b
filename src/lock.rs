//! # Lock — Advisory Task Locks on the Key-Value Store
//!
//! Mutual exclusion for named tasks via `SET lock:{name} <token> NX EX ttl`.
//! Whoever wins the conditional set runs; everyone else gets
//! [`LockOutcome::Skipped`] straight away. Contention is an ordinary outcome,
//! not an error.
//!
//! ## TTL
//!
//! The TTL only exists so that a crashed holder cannot wedge the task forever.
//! There is no renewal. A lock that expires while its holder is still running
//! lets a second run start, so callers size the TTL well above the worst-case
//! run time.
//!
//! ## Panics
//!
//! A panic inside the guarded closure still releases the lock before it is
//! resumed on the caller. Dropping the returned future mid-run does not
//! release it; the lock then lives out its TTL. Callers that can be cancelled
//! (request handlers) run the guarded work on its own task.
//!
//! ## Advisory
//!
//! Only code that goes through [`LockManager::run_with_lock`] is excluded.
//! With the process-local store ([`KvStore::is_process_local`]) exclusion is
//! limited to the current process.

use crate::kv::{KvStore, SetOptions};
use anyhow::Result;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, warn};

/// Key namespace for task locks. One namespace per configured store.
pub const LOCK_PREFIX: &str = "lock:";

/// What happened when a locked run was attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was taken, the closure ran, and the lock was released.
    Acquired(T),
    /// Another holder had the lock; nothing ran.
    Skipped,
}

impl<T> LockOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, LockOutcome::Skipped)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            LockOutcome::Acquired(v) => Some(v),
            LockOutcome::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    Acquire,
    Release,
}

impl fmt::Display for LockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockPhase::Acquire => write!(f, "acquire"),
            LockPhase::Release => write!(f, "release"),
        }
    }
}

/// The store failed while taking or releasing a lock.
///
/// Distinct from errors raised by the guarded closure so callers can tell
/// "the task failed" from "the lock machinery failed" with
/// `err.downcast_ref::<LockError>()`.
#[derive(Debug)]
pub struct LockError {
    pub lock: String,
    pub phase: LockPhase,
    pub source: anyhow::Error,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock '{}' {} failed: {:#}",
            self.lock, self.phase, self.source
        )
    }
}

impl std::error::Error for LockError {}

#[derive(Clone)]
pub struct LockManager {
    kv: KvStore,
}

impl LockManager {
    pub fn new(kv: KvStore) -> Self {
        LockManager { kv }
    }

    pub fn key_for(name: &str) -> String {
        format!("{}{}", LOCK_PREFIX, name)
    }

    /// Whether the lock is currently held by anyone.
    pub async fn is_held(&self, name: &str) -> Result<bool> {
        Ok(self.kv.get(&Self::key_for(name)).await?.is_some())
    }

    /// Run `f` while holding lock `name`.
    ///
    /// Returns [`LockOutcome::Skipped`] without waiting when the lock is held.
    /// Otherwise `f` runs and the lock is deleted afterwards whether `f`
    /// succeeded, failed or panicked; `f`'s error is returned after the
    /// release and a panic is resumed after it. A store failure during
    /// acquire or release comes back as a [`LockError`].
    pub async fn run_with_lock<T, F, Fut>(
        &self,
        name: &str,
        ttl: Duration,
        f: F,
    ) -> Result<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = Self::key_for(name);
        let token = uuid::Uuid::new_v4().to_string();

        let acquired = self
            .kv
            .set(&key, &token, SetOptions::nx(ttl))
            .await
            .map_err(|e| LockError {
                lock: name.to_string(),
                phase: LockPhase::Acquire,
                source: e,
            })?;
        if !acquired {
            debug!(lock = name, "lock held elsewhere, skipping");
            return Ok(LockOutcome::Skipped);
        }
        debug!(lock = name, ttl_secs = ttl.as_secs(), "lock acquired");

        let result = match AssertUnwindSafe(f()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                warn!(lock = name, "task panicked while holding lock, releasing");
                if let Err(e) = self.kv.delete(&key).await {
                    warn!(
                        lock = name,
                        error = %e,
                        "failed to release lock after panic; it will expire with its TTL"
                    );
                }
                std::panic::resume_unwind(panic);
            }
        };

        match (result, self.kv.delete(&key).await) {
            (Ok(value), Ok(())) => {
                debug!(lock = name, "lock released");
                Ok(LockOutcome::Acquired(value))
            }
            (Ok(_), Err(e)) => Err(LockError {
                lock: name.to_string(),
                phase: LockPhase::Release,
                source: e,
            }
            .into()),
            (Err(e), Ok(())) => {
                debug!(lock = name, "lock released after task error");
                Err(e)
            }
            (Err(e), Err(release_err)) => {
                warn!(
                    lock = name,
                    error = %release_err,
                    "failed to release lock after task error; it will expire with its TTL"
                );
                Err(e)
            }
        }
    }
}
