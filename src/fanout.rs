//! Bounded fan-out of independent work units.
//!
//! Region splitting and dataset extraction spawn one osmium process per
//! unit. A [`WorkerLimiter`] caps how many run at once; the same limiter is
//! shared by every stage of a run. All units of a stage are driven to
//! completion before the stage returns, even when some fail, and the
//! [`FanOutReport`] then decides (per [`FailurePolicy`]) whether the stage
//! failed as a whole. Under best-effort the failed units travel on in the
//! [`StageOutcome`] so later stages can tell "failed" apart from "empty".

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::FailurePolicy;
use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct WorkerLimiter {
    permits: Arc<Semaphore>,
}

impl WorkerLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Run `work` for every unit, at most `capacity` at a time, and wait for
    /// all of them.
    pub async fn run_all<U, T, F, Fut>(&self, stage: &str, units: Vec<U>, work: F) -> FanOutReport<T>
    where
        U: UnitLabel,
        F: Fn(U) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let total = units.len();
        let mut pending = FuturesUnordered::new();
        for unit in units {
            let permits = Arc::clone(&self.permits);
            let label = unit.label();
            let fut = work(unit);
            pending.push(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => fut.await,
                    Err(_) => Err(anyhow::anyhow!("worker limiter closed")),
                };
                (label, outcome)
            });
        }

        let mut report = FanOutReport {
            stage: stage.to_string(),
            total,
            completed: Vec::with_capacity(total),
            failures: Vec::new(),
        };
        while let Some((label, outcome)) = pending.next().await {
            match outcome {
                Ok(value) => report.completed.push(value),
                Err(err) => {
                    tracing::error!(stage, unit = %label, error = %format!("{:#}", err), "unit failed");
                    report.failures.push(UnitFailure {
                        unit: label,
                        error: format!("{:#}", err),
                    });
                }
            }
        }
        report
    }
}

/// Human-readable identifier of a unit of work, used in failure reports.
pub trait UnitLabel {
    fn label(&self) -> String;
}

impl UnitLabel for String {
    fn label(&self) -> String {
        self.clone()
    }
}

#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub unit: String,
    pub error: String,
}

#[derive(Debug)]
pub struct FanOutReport<T> {
    pub stage: String,
    pub total: usize,
    pub completed: Vec<T>,
    pub failures: Vec<UnitFailure>,
}

/// What survived a stage under the failure policy.
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub completed: Vec<T>,
    /// Units that failed and were tolerated. Always empty under
    /// [`FailurePolicy::Strict`].
    pub failed: Vec<UnitFailure>,
}

impl<T> StageOutcome<T> {
    pub fn failed_labels(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|f| f.unit.as_str())
    }
}

impl<T> FanOutReport<T> {
    /// Apply the failure policy: under [`FailurePolicy::Strict`] any failed
    /// unit fails the stage.
    pub fn into_result(self, policy: FailurePolicy) -> Result<StageOutcome<T>> {
        if let Some(first) = self.failures.first() {
            match policy {
                FailurePolicy::Strict => {
                    return Err(PipelineError::StageFailed {
                        stage: self.stage.clone(),
                        failed: self.failures.len(),
                        total: self.total,
                        first: format!("{}: {}", first.unit, first.error),
                    }
                    .into());
                }
                FailurePolicy::BestEffort => {
                    tracing::warn!(
                        stage = %self.stage,
                        failed = self.failures.len(),
                        total = self.total,
                        "continuing after unit failures"
                    );
                }
            }
        }
        Ok(StageOutcome {
            completed: self.completed,
            failed: self.failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_never_exceeds_capacity() {
        let limiter = WorkerLimiter::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let units: Vec<String> = (0..20).map(|i| format!("unit-{}", i)).collect();
        let report = limiter
            .run_all("test", units, |_unit| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await;

        assert_eq!(report.completed.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings() {
        let limiter = WorkerLimiter::new(2);
        let units: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let report = limiter
            .run_all("microregions", units, |unit| async move {
                if unit == "b" {
                    anyhow::bail!("osmium exited 1");
                }
                Ok(unit)
            })
            .await;

        assert_eq!(report.completed.len(), 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit, "b");

        let err = report.into_result(FailurePolicy::Strict).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::StageFailed { failed, total, .. }) => {
                assert_eq!(*failed, 1);
                assert_eq!(*total, 4);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_best_effort_keeps_successes() {
        let limiter = WorkerLimiter::new(2);
        let units: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let report = limiter
            .run_all("datasets", units, |unit| async move {
                if unit == "a" {
                    anyhow::bail!("boom");
                }
                Ok(unit)
            })
            .await;
        let done = report.into_result(FailurePolicy::BestEffort).unwrap();
        assert_eq!(done.completed, vec!["b".to_string()]);
        assert_eq!(done.failed_labels().collect::<Vec<_>>(), vec!["a"]);
    }
}
