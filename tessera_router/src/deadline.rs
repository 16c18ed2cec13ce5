use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Result, RouterError};

/// Absolute deadline shared by every step of one router operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Option<(Instant, Duration)>,
}

impl Deadline {
    /// Deadline `budget` from now; `None` never expires.
    pub(crate) fn after(budget: Option<Duration>) -> Self {
        Self { at: budget.map(|b| (Instant::now() + b, b)) }
    }

    /// Drive `fut` to completion or drop it when the deadline passes.
    pub(crate) async fn run<F: Future>(&self, op: &'static str, fut: F) -> Result<F::Output> {
        match self.at {
            None => Ok(fut.await),
            Some((at, budget)) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| RouterError::Timeout { op, after: budget }),
        }
    }
}
