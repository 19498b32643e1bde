//! Run-all-and-report execution for lab suites
//!
//! A suite keeps going after a failure: every scenario runs, every verdict
//! is recorded, and [`SuiteHarness::finish`] renders one summary and fails
//! if anything did. Skips from precondition gates are reported but never
//! fail the suite.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::info;

use stratus_harness::Skip;

/// How one scenario ended
pub enum Verdict {
    Passed,
    Failed(String),
    Skipped(String),
}

pub struct ScenarioResult {
    pub name: String,
    pub verdict: Verdict,
    pub duration: Duration,
}

/// Outcome a scenario body reports back
pub type ScenarioOutcome = Result<Option<Skip>, String>;

pub struct SuiteHarness {
    suite: String,
    results: Arc<Mutex<Vec<ScenarioResult>>>,
}

impl SuiteHarness {
    pub fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run one scenario, catching panics so a poisoned assertion cannot
    /// take the rest of the suite down with it.
    pub async fn run<F, Fut>(&self, name: &str, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ScenarioOutcome>,
    {
        info!(scenario = name, "---- scenario starting ----");
        let start = Instant::now();
        let result = AssertUnwindSafe(f()).catch_unwind().await;
        let verdict = match result {
            Ok(Ok(None)) => Verdict::Passed,
            Ok(Ok(Some(skip))) => Verdict::Skipped(skip.reason),
            Ok(Err(e)) => Verdict::Failed(e),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Verdict::Failed(format!("PANIC: {msg}"))
            }
        };
        self.results.lock().unwrap().push(ScenarioResult {
            name: name.to_string(),
            verdict,
            duration: start.elapsed(),
        });
    }

    /// Render the summary; error lists the failed scenario names.
    pub fn finish(&self) -> Result<(), String> {
        let results = self.results.lock().unwrap();
        let total: Duration = results.iter().map(|r| r.duration).sum();
        let mut passed = 0;
        let mut failed: Vec<&str> = Vec::new();
        let mut skipped = 0;

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for r in results.iter() {
            let (tag, detail) = match &r.verdict {
                Verdict::Passed => {
                    passed += 1;
                    ("PASS", None)
                }
                Verdict::Failed(e) => {
                    failed.push(&r.name);
                    ("FAIL", Some(e.as_str()))
                }
                Verdict::Skipped(reason) => {
                    skipped += 1;
                    ("SKIP", Some(reason.as_str()))
                }
            };
            info!("  {tag}  {:44} {:.1}s", r.name, r.duration.as_secs_f64());
            if let Some(detail) = detail {
                let truncated = if detail.len() > 200 {
                    &detail[..200]
                } else {
                    detail
                };
                info!("        -> {truncated}");
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed, {} skipped ({:.1}s total)",
            passed,
            failed.len(),
            skipped,
            total.as_secs_f64()
        );
        info!("========================================");

        if failed.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "{} scenario(s) failed in {}: {}",
                failed.len(),
                self.suite,
                failed.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failures_and_skips_are_both_recorded_without_stopping() {
        let harness = SuiteHarness::new("unit");
        harness.run("passes", || async { Ok(None) }).await;
        harness
            .run("fails", || async { Err("boom".to_string()) })
            .await;
        harness
            .run("skips", || async { Ok(Some(Skip::new("no standby"))) })
            .await;
        harness
            .run("panics", || async { panic!("assert blew up") })
            .await;

        let err = harness.finish().unwrap_err();
        assert!(err.contains("2 scenario(s) failed"));
        assert!(err.contains("fails"));
        assert!(err.contains("panics"));
        assert!(!err.contains("skips"));
    }
}
