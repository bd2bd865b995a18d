//! Optimistic concurrency: etag stamping and validation.
//!
//! An etag is `<ticks>-<digest>`: twenty zero-padded digits of wall-clock
//! nanoseconds followed by the first eight hex characters of
//! `sha256(key)`. Ticks are forced strictly increasing per controller, so
//! two writes from this process never share an etag even when the clock
//! stalls or steps backwards.
//!
//! Validation is check-then-act: the current etag is read and compared
//! before the write is issued, with no backend transaction spanning both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Outcome of comparing an expected etag with the stored one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EtagCheck {
    Match,
    Mismatch { actual: String },
    /// The key has no stored row.
    NotFound,
}

impl EtagCheck {
    /// Turn a check into a result, treating a mismatch as a conflict.
    pub fn into_result(self, key: &str, expected: &str) -> StoreResult<Self> {
        match self {
            EtagCheck::Mismatch { actual } => Err(StoreError::EtagMismatch {
                key: key.to_string(),
                expected: expected.to_string(),
                actual,
            }),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConcurrencyController {
    last_ticks: AtomicU64,
}

impl ConcurrencyController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh etag for `key`.
    pub fn stamp(&self, key: &str) -> String {
        let ticks = self.next_ticks();
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        format!("{ticks:020}-{}", &digest[..8])
    }

    /// Compare `expected` against the stored etag, if any.
    pub fn validate(&self, key: &str, expected: &str, current: Option<&str>) -> EtagCheck {
        match current {
            None => EtagCheck::NotFound,
            Some(actual) if actual == expected => EtagCheck::Match,
            Some(actual) => {
                debug!(key, expected, actual, "etag mismatch");
                EtagCheck::Mismatch {
                    actual: actual.to_string(),
                }
            }
        }
    }

    fn next_ticks(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let mut last = self.last_ticks.load(Ordering::Relaxed);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last_ticks
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }
}
