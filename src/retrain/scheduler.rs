//! Retrain trigger state machine and background worker.
//!
//! `idle → retraining` when the count trigger or the drift trigger fires on
//! a validated ingest. The job runs on a blocking thread under a timeout;
//! only a fully built and persisted bundle is swapped in. Any failure leaves
//! the serving bundle untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::{new_version, RetrainJob};
use super::registry::{ModelRegistry, RpmSlot};
use super::RetrainError;
use crate::config::RetrainConfig;
use crate::drift::{DriftDetector, DriftReport, ErrorObservation};
use crate::model::{ModelBundle, ModelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Count,
    Drift,
    Manual,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => write!(f, "count"),
            Self::Drift => write!(f, "drift"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// What one validated ingest did to the trigger state.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerDecision {
    pub rpm: String,
    /// Validated samples for the RPM including this one
    pub count: u64,
    pub count_triggered: bool,
    /// Present once a bundle is available to compare against
    pub drift: Option<DriftReport>,
    pub reason: Option<TriggerReason>,
    /// A retrain task was actually started (false when coalesced)
    pub dispatched: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetrainStatus {
    Succeeded { version: String },
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainOutcome {
    pub rpm: String,
    pub reason: TriggerReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: RetrainStatus,
}

type RetrainHandle = JoinHandle<Result<Arc<ModelBundle>, RetrainError>>;

pub struct RetrainScheduler {
    registry: Arc<ModelRegistry>,
    job: Arc<dyn RetrainJob>,
    detector: DriftDetector,
    count_interval: u64,
    timeout: Duration,
    outcomes: Arc<Mutex<HashMap<String, RetrainOutcome>>>,
}

impl fmt::Debug for RetrainScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrainScheduler")
            .field("count_interval", &self.count_interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RetrainScheduler {
    pub fn new(
        registry: Arc<ModelRegistry>,
        job: Arc<dyn RetrainJob>,
        detector: DriftDetector,
        config: &RetrainConfig,
    ) -> Self {
        Self {
            registry,
            job,
            detector,
            count_interval: config.count_interval,
            timeout: Duration::from_secs(config.timeout_secs),
            outcomes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the retrain timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Count trigger: every positive multiple of the interval.
    pub fn count_triggered(&self, count: u64) -> bool {
        self.count_interval > 0 && count > 0 && count % self.count_interval == 0
    }

    /// Drift evaluation of `recent` against the serving bundle of `rpm`.
    pub fn evaluate_drift(&self, rpm: &str, recent: &[f64]) -> Option<DriftReport> {
        let bundle = self.registry.get(rpm).ok()?;
        Some(
            self.detector
                .evaluate(recent, bundle.baseline_errors(), bundle.threshold_value()),
        )
    }

    /// Record one validated ingest and start a retrain if either trigger fires.
    ///
    /// The count increment is a single atomic fetch-add, so concurrent
    /// ingests for one RPM each observe a distinct count.
    pub fn on_validated_ingest(
        &self,
        rpm: &str,
        observation: impl Into<ErrorObservation>,
    ) -> TriggerDecision {
        let count = self.registry.increment_count(rpm);
        let recent = self.registry.record_error(rpm, observation);

        let count_triggered = self.count_triggered(count);
        let drift = self.evaluate_drift(rpm, &recent);
        let reason = if count_triggered {
            Some(TriggerReason::Count)
        } else if drift.is_some_and(|d| d.should_retrain) {
            Some(TriggerReason::Drift)
        } else {
            None
        };

        if let Some(report) = &drift {
            debug!(
                rpm,
                count,
                samples = report.samples,
                variance = report.variance,
                tcr = report.tcr,
                p_value = report.p_value,
                "Drift evaluated"
            );
        }

        let dispatched = match reason {
            Some(reason) => match self.request(rpm, reason) {
                Ok(_) => true,
                Err(RetrainError::InProgress { .. }) => {
                    debug!(rpm, %reason, "Retrain already running, trigger coalesced");
                    false
                }
                Err(e) => {
                    warn!(rpm, %reason, error = %e, "Retrain could not be started");
                    false
                }
            },
            None => false,
        };

        TriggerDecision {
            rpm: rpm.to_string(),
            count,
            count_triggered,
            drift,
            reason,
            dispatched,
        }
    }

    /// Start a retrain for `rpm` unless one is already in flight.
    ///
    /// Must be called from within a tokio runtime. The returned handle
    /// resolves to the installed bundle.
    pub fn request(&self, rpm: &str, reason: TriggerReason) -> Result<RetrainHandle, RetrainError> {
        let slot = self.registry.slot(rpm);
        if !slot.try_begin_retrain() {
            return Err(RetrainError::InProgress {
                rpm: rpm.to_string(),
            });
        }
        let guard = InFlight(slot);

        let registry = Arc::clone(&self.registry);
        let job = Arc::clone(&self.job);
        let outcomes = Arc::clone(&self.outcomes);
        let timeout = self.timeout;
        let rpm = rpm.to_string();
        info!(rpm = %rpm, %reason, timeout_secs = timeout.as_secs(), "Retrain started");

        Ok(tokio::spawn(async move {
            let _guard = guard;
            let started_at = Utc::now();
            let result = run_retrain(&registry, job, &rpm, timeout).await;

            let status = match &result {
                Ok(bundle) => {
                    info!(rpm = %rpm, version = bundle.version(), %reason, "Retrain finished");
                    RetrainStatus::Succeeded {
                        version: bundle.version().to_string(),
                    }
                }
                Err(e) => {
                    warn!(rpm = %rpm, %reason, error = %e, "Retrain failed, keeping current model");
                    RetrainStatus::Failed {
                        message: e.to_string(),
                    }
                }
            };
            outcomes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    rpm.clone(),
                    RetrainOutcome {
                        rpm: rpm.clone(),
                        reason,
                        started_at,
                        finished_at: Utc::now(),
                        status,
                    },
                );
            result
        }))
    }

    pub fn is_retraining(&self, rpm: &str) -> bool {
        self.registry.is_retraining(rpm)
    }

    /// The most recent finished retrain for `rpm`.
    pub fn last_outcome(&self, rpm: &str) -> Option<RetrainOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rpm)
            .cloned()
    }
}

/// Releases the per-RPM single-flight flag when the retrain task ends.
struct InFlight(Arc<RpmSlot>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.end_retrain();
    }
}

async fn run_retrain(
    registry: &Arc<ModelRegistry>,
    job: Arc<dyn RetrainJob>,
    rpm: &str,
    timeout: Duration,
) -> Result<Arc<ModelBundle>, RetrainError> {
    let cancel = CancellationToken::new();
    let mut build = {
        let cancel = cancel.clone();
        let rpm = rpm.to_string();
        let version = new_version();
        tokio::task::spawn_blocking(move || job.build(&rpm, &version, &cancel))
    };

    let bundle = match tokio::time::timeout(timeout, &mut build).await {
        Ok(joined) => joined.map_err(|e| RetrainError::Join(e.to_string()))??,
        Err(_) => {
            // The build stops at its next checkpoint. The single-flight slot
            // stays held until it has, so no second build can overlap it.
            cancel.cancel();
            if let Ok(Err(e)) = build.await {
                debug!(rpm, error = %e, "Timed-out build stopped");
            }
            return Err(RetrainError::TimedOut {
                rpm: rpm.to_string(),
                secs: timeout.as_secs(),
            });
        }
    };
    if bundle.rpm() != rpm {
        return Err(ModelError::InvalidModel(format!(
            "retrain for RPM {rpm} produced a bundle for RPM {}",
            bundle.rpm()
        ))
        .into());
    }

    // Persist before swapping so a restart serves the same bundle.
    let bundle = Arc::new(bundle);
    let persist = {
        let registry = Arc::clone(registry);
        let bundle = Arc::clone(&bundle);
        tokio::task::spawn_blocking(move || registry.artifacts().save_versioned(&bundle))
    };
    persist
        .await
        .map_err(|e| RetrainError::Join(e.to_string()))??;

    registry.install(Arc::clone(&bundle));
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::{tiny_bundle, tiny_bundle_version};
    use crate::model::ArtifactStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Builds a tiny bundle after `delay`, honouring cancellation.
    struct StubJob {
        threshold: f64,
        delay: Duration,
        calls: AtomicUsize,
        running: AtomicUsize,
    }

    impl StubJob {
        fn new(threshold: f64, delay: Duration) -> Self {
            Self {
                threshold,
                delay,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
            }
        }
    }

    struct Running<'a>(&'a AtomicUsize);

    impl Drop for Running<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl RetrainJob for StubJob {
        fn build(
            &self,
            rpm: &str,
            _version: &str,
            cancel: &CancellationToken,
        ) -> Result<ModelBundle, RetrainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.running.fetch_add(1, Ordering::SeqCst);
            let _running = Running(&self.running);
            let deadline = std::time::Instant::now() + self.delay;
            while std::time::Instant::now() < deadline {
                if cancel.is_cancelled() {
                    return Err(ModelError::Cancelled.into());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(tiny_bundle(rpm, self.threshold)?)
        }
    }

    fn scheduler(dir: &std::path::Path, job: Arc<StubJob>) -> RetrainScheduler {
        let registry = Arc::new(ModelRegistry::new(
            ArtifactStore::new(dir.join("models"), dir.join("features")),
            100,
        ));
        RetrainScheduler::new(
            registry,
            job,
            DriftDetector::default(),
            &RetrainConfig::default(),
        )
    }

    #[test]
    fn test_count_trigger_multiples() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let s = scheduler(dir.path(), Arc::new(StubJob::new(0.5, Duration::ZERO)));
        assert!(!s.count_triggered(0));
        assert!(!s.count_triggered(99));
        assert!(s.count_triggered(100));
        assert!(!s.count_triggered(150));
        assert!(s.count_triggered(200));
        assert!(s.count_triggered(300));
    }

    #[tokio::test]
    async fn test_request_installs_bundle() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let job = Arc::new(StubJob::new(0.7, Duration::ZERO));
        let s = scheduler(dir.path(), Arc::clone(&job));

        let handle = s.request("800", TriggerReason::Manual).expect("start");
        let bundle = handle.await.expect("join").expect("retrain");
        assert!((bundle.threshold_value() - 0.7).abs() < 1e-12);
        assert!(Arc::ptr_eq(&s.registry().peek("800").expect("installed"), &bundle));
        assert!(s.registry().artifacts().has_model("800"));
        assert!(!s.is_retraining("800"));
        assert!(matches!(
            s.last_outcome("800").map(|o| o.status),
            Some(RetrainStatus::Succeeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_request_is_coalesced() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let job = Arc::new(StubJob::new(0.7, Duration::from_millis(200)));
        let s = scheduler(dir.path(), Arc::clone(&job));

        let first = s.request("800", TriggerReason::Count).expect("start");
        assert!(matches!(
            s.request("800", TriggerReason::Drift),
            Err(RetrainError::InProgress { .. })
        ));
        // Other RPMs are independent.
        let other = s.request("1000", TriggerReason::Count).expect("start other");

        first.await.expect("join").expect("retrain");
        other.await.expect("join").expect("retrain");
        assert_eq!(job.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_keeps_old_bundle() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let job = Arc::new(StubJob::new(0.9, Duration::from_secs(5)));
        let s = scheduler(dir.path(), job).with_timeout(Duration::from_millis(50));
        let old = Arc::new(tiny_bundle("800", 0.5).expect("bundle"));
        s.registry().install(Arc::clone(&old));

        let result = s
            .request("800", TriggerReason::Manual)
            .expect("start")
            .await
            .expect("join");
        assert!(matches!(result, Err(RetrainError::TimedOut { .. })));
        assert!(Arc::ptr_eq(&s.registry().peek("800").expect("bundle"), &old));
        assert!(matches!(
            s.last_outcome("800").map(|o| o.status),
            Some(RetrainStatus::Failed { .. })
        ));
        assert!(!s.registry().artifacts().has_model("800"));
    }

    #[tokio::test]
    async fn test_timed_out_build_stops_before_slot_is_released() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let job = Arc::new(StubJob::new(0.9, Duration::from_secs(5)));
        let s = scheduler(dir.path(), Arc::clone(&job)).with_timeout(Duration::from_millis(50));

        let result = s
            .request("800", TriggerReason::Manual)
            .expect("start")
            .await
            .expect("join");
        assert!(matches!(result, Err(RetrainError::TimedOut { .. })));
        assert_eq!(job.running.load(Ordering::SeqCst), 0);
        assert!(!s.is_retraining("800"));

        // The next request starts a fresh build with nothing left over.
        let next = s.request("800", TriggerReason::Manual).expect("start");
        assert!(matches!(
            next.await.expect("join"),
            Err(RetrainError::TimedOut { .. })
        ));
        assert_eq!(job.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_error_after_swap_is_not_recorded() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let s = scheduler(dir.path(), Arc::new(StubJob::new(0.5, Duration::ZERO)));
        let old = Arc::new(tiny_bundle("800", 0.5).expect("bundle"));
        s.registry().install(Arc::clone(&old));
        s.registry().install(Arc::new(
            tiny_bundle_version("800", "v-next", 0.5).expect("bundle"),
        ));

        let decision =
            s.on_validated_ingest("800", ErrorObservation::new(9.0).scored_by(old.version()));
        assert_eq!(decision.count, 1);
        assert_eq!(decision.drift.map(|d| d.samples), Some(0));
        assert!(s.registry().recent_errors("800").is_empty());
    }

    #[tokio::test]
    async fn test_hundredth_ingest_dispatches() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let job = Arc::new(StubJob::new(0.5, Duration::ZERO));
        let s = scheduler(dir.path(), Arc::clone(&job));

        for _ in 0..99 {
            let decision = s.on_validated_ingest("800", 0.1);
            assert!(decision.reason.is_none());
            assert!(decision.drift.is_none(), "no bundle yet");
        }
        let decision = s.on_validated_ingest("800", 0.1);
        assert_eq!(decision.count, 100);
        assert!(decision.count_triggered);
        assert_eq!(decision.reason, Some(TriggerReason::Count));
        assert!(decision.dispatched);
    }
}
