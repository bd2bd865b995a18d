//! Per-operation cancellation and deadline context.
//!
//! Every public operation takes an [`OpContext`]. Blocking points (waiting
//! for a pool permit, connecting, executing, backoff sleeps) run through
//! [`OpContext::run`] so a cancelled or expired context aborts promptly.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};

/// Cancellation token plus optional deadline for one logical operation.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that never expires unless cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Bind this context to an externally owned cancellation token.
    pub fn with_token(self, token: CancellationToken) -> Self {
        Self { token, ..self }
    }

    /// Cancel the context; in-flight and future waits return `Cancelled`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the context is already cancelled or past its deadline.
    pub fn check(&self) -> StoreResult<()> {
        if self.token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StoreError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context ends first.
    pub async fn run<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.check()?;
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StoreError::Cancelled),
            _ = expired => Err(StoreError::DeadlineExceeded),
            result = fut => result,
        }
    }

    /// Sleep for `duration`, waking early with an error if the context ends.
    pub async fn sleep(&self, duration: Duration) -> StoreResult<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}
