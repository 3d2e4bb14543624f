//! RPM-keyed registry of live model bundles.
//!
//! Each slot holds its bundle behind an `ArcSwapOption`, so a predict call
//! loads one `Arc<ModelBundle>` snapshot and keeps using it even if a
//! retrain swaps the slot mid-request.

use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

use crate::drift::{DriftWindow, ErrorObservation};
use crate::model::{ArtifactStore, ModelBundle, ModelError};

/// Live state of one RPM operating point.
#[derive(Debug)]
pub struct RpmSlot {
    bundle: ArcSwapOption<ModelBundle>,
    drift: Mutex<DriftWindow>,
    count: AtomicU64,
    in_flight: AtomicBool,
}

impl RpmSlot {
    fn new(drift_capacity: usize) -> Self {
        Self {
            bundle: ArcSwapOption::empty(),
            drift: Mutex::new(DriftWindow::new(drift_capacity)),
            count: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn bundle(&self) -> Option<Arc<ModelBundle>> {
        self.bundle.load_full()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_retraining(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim the single retrain slot. Returns false if one is running.
    pub(crate) fn try_begin_retrain(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_retrain(&self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

/// Owns every RPM slot plus the artifact store bundles are loaded from.
///
/// Slots are only created by writes (seeding, counting, installs, retrain
/// requests). Read paths never add one, so lookups for unknown RPMs leave
/// the map as it was.
#[derive(Debug)]
pub struct ModelRegistry {
    artifacts: ArtifactStore,
    drift_capacity: usize,
    slots: RwLock<HashMap<String, Arc<RpmSlot>>>,
    /// Serializes lazy loads from disk
    load_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(artifacts: ArtifactStore, drift_capacity: usize) -> Self {
        Self {
            artifacts,
            drift_capacity,
            slots: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// The slot for `rpm` if one exists.
    pub fn existing(&self, rpm: &str) -> Option<Arc<RpmSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rpm)
            .cloned()
    }

    /// The slot for `rpm`, created empty on first use.
    pub fn slot(&self, rpm: &str) -> Arc<RpmSlot> {
        if let Some(slot) = self.existing(rpm) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(rpm.to_string())
                .or_insert_with(|| Arc::new(RpmSlot::new(self.drift_capacity))),
        )
    }

    /// RPMs with a slot, sorted.
    pub fn rpms(&self) -> Vec<String> {
        let mut rpms: Vec<String> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        rpms.sort();
        rpms
    }

    /// Current bundle for `rpm` without touching disk.
    pub fn peek(&self, rpm: &str) -> Option<Arc<ModelBundle>> {
        self.existing(rpm).and_then(|slot| slot.bundle())
    }

    pub fn is_retraining(&self, rpm: &str) -> bool {
        self.existing(rpm).is_some_and(|slot| slot.is_retraining())
    }

    /// Current bundle for `rpm`, loading the on-disk artifacts on first use.
    ///
    /// A slot is only created once a bundle has loaded; a missing model
    /// leaves the registry unchanged.
    pub fn get(&self, rpm: &str) -> Result<Arc<ModelBundle>, ModelError> {
        if let Some(bundle) = self.peek(rpm) {
            return Ok(bundle);
        }

        let _guard = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bundle) = self.peek(rpm) {
            return Ok(bundle);
        }
        let bundle = Arc::new(self.artifacts.load_bundle(rpm)?);
        let slot = self.slot(rpm);
        // A retrain that installed while we read from disk wins.
        let previous = slot
            .bundle
            .compare_and_swap(&None::<Arc<ModelBundle>>, Some(Arc::clone(&bundle)));
        if let Some(installed) = previous.as_ref() {
            return Ok(Arc::clone(installed));
        }
        info!(
            rpm,
            version = bundle.version(),
            feature_dim = bundle.preprocess().feature_dim(),
            threshold = bundle.threshold_value(),
            "Model bundle loaded"
        );
        Ok(bundle)
    }

    /// Swap in `bundle` for its RPM and reset the drift window so future
    /// comparisons run against the new baseline. Returns the replaced bundle.
    ///
    /// The swap happens before the window lock is taken, so any error scored
    /// by the replaced bundle and recorded afterwards is rejected by
    /// `record_error`.
    pub fn install(&self, bundle: Arc<ModelBundle>) -> Option<Arc<ModelBundle>> {
        let slot = self.slot(bundle.rpm());
        let previous = slot.bundle.swap(Some(Arc::clone(&bundle)));
        slot.drift
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(
            rpm = bundle.rpm(),
            version = bundle.version(),
            previous = previous.as_ref().map_or("none", |b| b.version()),
            "Model bundle swapped"
        );
        previous
    }

    /// Restore the validated-sample count and drift history after a restart.
    pub fn seed(&self, rpm: &str, count: u64, history: Vec<ErrorObservation>) {
        let slot = self.slot(rpm);
        slot.count.store(count, Ordering::Release);
        *slot.drift.lock().unwrap_or_else(PoisonError::into_inner) =
            DriftWindow::from_history(self.drift_capacity, history);
        debug!(rpm, count, "Seeded RPM slot from stored samples");
    }

    /// Atomically bump the validated-sample count, returning the new value.
    pub fn increment_count(&self, rpm: &str) -> u64 {
        self.slot(rpm).count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Roll back the count after deleted samples.
    pub fn decrement_count(&self, rpm: &str, by: u64) {
        let Some(slot) = self.existing(rpm) else {
            return;
        };
        let _ = slot
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(by))
            });
    }

    /// Append one validated error and return the window contents, oldest first.
    ///
    /// An observation tagged with a bundle version that is no longer serving
    /// is dropped: its error belongs to the window `install` already cleared.
    pub fn record_error(&self, rpm: &str, observation: impl Into<ErrorObservation>) -> Vec<f64> {
        let observation = observation.into();
        let slot = self.slot(rpm);
        let mut window = slot.drift.lock().unwrap_or_else(PoisonError::into_inner);
        let serving = slot.bundle();
        let stale = match (observation.scored_by.as_deref(), serving.as_deref()) {
            (Some(scored_by), Some(serving)) => scored_by != serving.version(),
            _ => false,
        };
        if stale {
            debug!(
                rpm,
                scored_by = observation.scored_by.as_deref().unwrap_or_default(),
                "Dropped error scored by a replaced bundle"
            );
        } else {
            window.push_observation(observation);
        }
        window.errors()
    }

    /// Remove a deleted sample's errors from the drift window.
    pub fn forget_sample(&self, rpm: &str, sha256: &str) -> usize {
        let Some(slot) = self.existing(rpm) else {
            return 0;
        };
        let mut window = slot.drift.lock().unwrap_or_else(PoisonError::into_inner);
        window.remove_sample(sha256)
    }

    pub fn recent_errors(&self, rpm: &str) -> Vec<f64> {
        let Some(slot) = self.existing(rpm) else {
            return Vec::new();
        };
        let window = slot.drift.lock().unwrap_or_else(PoisonError::into_inner);
        window.errors()
    }
}
