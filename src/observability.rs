// [src/observability.rs]
//! Observability surface (component C10).
//!
//! A small named-counter registry plus a serializable health snapshot,
//! grounded on the structured-counter half of `apps/orchestrator`'s event
//! bus with the broadcast/WebSocket transport stripped out — that belongs
//! to the excluded HTTP layer, not this core. Counters auto-vivify on
//! first increment so per-kind labels (`auth_failure_total{kind="..."}`)
//! don't need to be enumerated up front.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;

/// Fixed counter names this crate increments, plus a helper for the
/// dynamic per-kind failure counters.
pub mod counters {
    pub const AUTH_ATTEMPTS: &str = "auth_attempts_total";
    pub const AUTH_SUCCESSES: &str = "auth_successes_total";
    pub const AUTH_DENIALS: &str = "auth_denials_total";
    pub const REPLAY_REJECTIONS: &str = "replay_rejections_total";
    pub const PAC_MISSING: &str = "pac_missing_total";
    pub const PAC_INVALID: &str = "pac_invalid_total";
    pub const ROTATION_ATTEMPTS: &str = "rotation_attempts_total";
    pub const ROTATIONS_COMPLETED: &str = "rotations_completed_total";
    pub const ROTATIONS_FAILED: &str = "rotations_failed_total";

    /// Counter name for a specific [`crate::error::CoreError::kind`],
    /// e.g. `auth_failure_total{kind="ErrReplay"}`.
    pub fn auth_failure_by_kind(kind: &str) -> String {
        format!("auth_failure_total{{kind=\"{kind}\"}}")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub counters: HashMap<String, u64>,
    pub config_present: bool,
    pub rotation_enabled: bool,
    pub rotation_status: String,
    pub last_rotation: Option<i64>,
    pub keytab_kvno: Option<u32>,
}

/// `HashMap<String, AtomicU64>` behind an `RwLock`, sufficient at this
/// crate's counter cardinality without reaching for `dashmap`, which
/// nothing else in this workspace depends on.
pub struct ObservabilityRegistry {
    counters: RwLock<HashMap<String, AtomicU64>>,
}

impl ObservabilityRegistry {
    pub fn new() -> Self {
        use counters::*;
        let mut map = HashMap::new();
        for name in [
            AUTH_ATTEMPTS,
            AUTH_SUCCESSES,
            AUTH_DENIALS,
            REPLAY_REJECTIONS,
            PAC_MISSING,
            PAC_INVALID,
            ROTATION_ATTEMPTS,
            ROTATIONS_COMPLETED,
            ROTATIONS_FAILED,
        ] {
            map.insert(name.to_string(), AtomicU64::new(0));
        }
        Self { counters: RwLock::new(map) }
    }

    /// Increments `name`, creating it on first use if it isn't already
    /// registered. Double-checked locking: the common case (an existing
    /// counter) only ever takes the read lock.
    pub fn increment(&self, name: impl AsRef<str>) {
        let name = name.as_ref();
        {
            let guard = self.counters.read().expect("observability registry poisoned");
            if let Some(counter) = guard.get(name) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut guard = self.counters.write().expect("observability registry poisoned");
        guard
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, name: impl AsRef<str>) -> u64 {
        let guard = self.counters.read().expect("observability registry poisoned");
        guard.get(name.as_ref()).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn counters_snapshot(&self) -> HashMap<String, u64> {
        let guard = self.counters.read().expect("observability registry poisoned");
        guard.iter().map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed))).collect()
    }
}

impl Default for ObservabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
