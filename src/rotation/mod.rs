// [src/rotation/mod.rs]
//! Rotation Controller (component C9).
//!
//! Drives a gMSA keytab through age check -> lock -> optional backup ->
//! generate -> self-test -> atomic config swap -> notify, tracked through a
//! persisted state record rather than an in-memory-only enum, so a host
//! restart doesn't lose the last known rotation outcome. Grounded on
//! `AppState`'s `Arc<RwLock<SystemMode>>` pattern: one lock gates concurrent
//! rotations, one `RwLock` exposes the current state to readers without
//! blocking them on an in-flight rotation. Each generate/validate/persist
//! step runs under its own timeout and is retried up to `max_retries` times
//! with a fixed delay before the whole cycle is given up as failed.

pub mod collaborators;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::ConfigStore;
use crate::error::{CoreError, CoreResult};
use crate::keytab::Keytab;
use crate::observability::{counters, ObservabilityRegistry};
use crate::spnego;
use crate::storage::Storage;
use collaborators::{DomainInspector, KeytabGenerator, NotificationSink, RotationEvent};

const ROTATION_STATE_KEY: &str = "rotation/state";

/// Coarse rotation lifecycle. `last_error`/`kvno`/timestamps in
/// [`RotationState`] carry the detail a bare enum variant used to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Persisted rotation record, stored under [`ROTATION_STATE_KEY`] so a
/// fresh controller instance can report the last known outcome instead of
/// starting blind at `Idle`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RotationState {
    pub status: RotationStatus,
    pub last_check: Option<i64>,
    pub last_rotation: Option<i64>,
    pub next_rotation: Option<i64>,
    pub last_error: Option<String>,
    pub password_age_sec: Option<u64>,
    pub kvno: Option<u32>,
}

impl Default for RotationState {
    fn default() -> Self {
        Self {
            status: RotationStatus::Idle,
            last_check: None,
            last_rotation: None,
            next_rotation: None,
            last_error: None,
            password_age_sec: None,
            kvno: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub enabled: bool,
    /// How often a host's scheduler is expected to call `maybe_rotate`.
    pub check_interval_sec: u64,
    /// Minimum gMSA managed-password age before `maybe_rotate` acts.
    pub rotation_threshold_sec: u64,
    /// Attempts per rotation step (generate, validate, persist) before the
    /// cycle is given up as failed.
    pub max_retries: u32,
    pub retry_delay_sec: u64,
    /// Per-step deadline; a step that doesn't finish within this is treated
    /// as a failure of that step, eligible for retry like any other.
    pub step_timeout_sec: u64,
    /// Presence of an endpoint is what enables notification delivery — the
    /// sink itself is always wired in by the host, `None` just means there
    /// is nothing listening to tell.
    pub notification_endpoint: Option<String>,
    /// Whether to retain the previous keytab bytes in the returned outcome
    /// before they are overwritten (§4.9's optional backup step).
    pub backup_enabled: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_sec: 3600,
            rotation_threshold_sec: 24 * 3600,
            max_retries: 3,
            retry_delay_sec: 30,
            step_timeout_sec: 30,
            notification_endpoint: None,
            backup_enabled: true,
        }
    }
}

/// Outcome of a completed rotation attempt, including the previous keytab
/// bytes when backup was enabled.
pub struct RotationOutcome {
    pub state: RotationState,
    pub backup: Option<Vec<u8>>,
}

pub struct RotationController {
    lock: Mutex<()>,
    state: RwLock<RotationState>,
    storage: Arc<dyn Storage>,
    config_store: Arc<ConfigStore>,
    inspector: Arc<dyn DomainInspector>,
    generator: Arc<dyn KeytabGenerator>,
    sink: Arc<dyn NotificationSink>,
    observability: Arc<ObservabilityRegistry>,
    cfg: RotationConfig,
}

impl RotationController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        config_store: Arc<ConfigStore>,
        inspector: Arc<dyn DomainInspector>,
        generator: Arc<dyn KeytabGenerator>,
        sink: Arc<dyn NotificationSink>,
        observability: Arc<ObservabilityRegistry>,
        cfg: RotationConfig,
    ) -> Self {
        Self {
            lock: Mutex::new(()),
            state: RwLock::new(RotationState::default()),
            storage,
            config_store,
            inspector,
            generator,
            sink,
            observability,
            cfg,
        }
    }

    /// Loads any persisted rotation state, or persists the default record
    /// if this is the controller's first ever start. Hosts call this once
    /// after construction, before the first `maybe_rotate`/`rotate_now`.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> CoreResult<()> {
        match self.load_state().await? {
            Some(persisted) => {
                *self.state.write().await = persisted;
            }
            None => {
                self.persist_state(&RotationState::default()).await?;
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub async fn state(&self) -> RotationState {
        self.state.read().await.clone()
    }

    async fn load_state(&self) -> CoreResult<Option<RotationState>> {
        let raw = crate::storage::with_retry(|| {
            let storage = self.storage.clone();
            async move { storage.get(ROTATION_STATE_KEY).await }
        })
        .await?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let state = serde_json::from_slice(&bytes).map_err(|e| CoreError::Storage(format!("rotation state record corrupt: {e}")))?;
                Ok(Some(state))
            }
        }
    }

    async fn persist_state(&self, state: &RotationState) -> CoreResult<()> {
        let serialized = serde_json::to_vec(state).map_err(|e| CoreError::RotationPersist(format!("state serialization failed: {e}")))?;
        crate::storage::with_retry(|| {
            let storage = self.storage.clone();
            let serialized = serialized.clone();
            async move { storage.put(ROTATION_STATE_KEY, serialized).await }
        })
        .await
        .map_err(|e| CoreError::RotationPersist(e.to_string()))
    }

    async fn set_state(&self, state: RotationState) -> CoreResult<()> {
        self.persist_state(&state).await?;
        *self.state.write().await = state;
        Ok(())
    }

    /// Rotates only if the gMSA's managed password is old enough; otherwise
    /// returns the current state unchanged without taking the rotation
    /// lock at all. A no-op when `cfg.enabled` is false.
    #[tracing::instrument(skip(self), fields(spn = %spn))]
    pub async fn maybe_rotate(&self, spn: &str, realm: &str, now_sec: i64) -> CoreResult<RotationState> {
        if !self.cfg.enabled {
            return Ok(self.state().await);
        }

        let age = self.inspector.password_age_sec(spn).await?;
        let next_rotation = now_sec + (self.cfg.rotation_threshold_sec.saturating_sub(age)) as i64;
        let mut current = self.state().await;
        current.last_check = Some(now_sec);
        current.password_age_sec = Some(age);
        current.next_rotation = Some(next_rotation);
        self.set_state(current).await?;

        if age < self.cfg.rotation_threshold_sec {
            tracing::debug!(age, threshold = self.cfg.rotation_threshold_sec, "password not old enough to rotate");
            return Ok(self.state().await);
        }
        self.rotate_now(spn, realm, now_sec).await
    }

    /// Unconditionally runs one rotation cycle. Returns `CoreError::Busy`
    /// if a cycle is already in flight.
    #[tracing::instrument(skip(self), fields(spn = %spn))]
    pub async fn rotate_now(&self, spn: &str, realm: &str, now_sec: i64) -> CoreResult<RotationState> {
        let outcome = self.rotate_with_backup(spn, realm, now_sec).await?;
        Ok(outcome.state)
    }

    /// Same as [`Self::rotate_now`] but also returns the pre-rotation
    /// keytab bytes when `backup_enabled` is set.
    pub async fn rotate_with_backup(&self, spn: &str, realm: &str, now_sec: i64) -> CoreResult<RotationOutcome> {
        let _guard = self.lock.try_lock().map_err(|_| CoreError::Busy)?;
        self.observability.increment(counters::ROTATION_ATTEMPTS);
        self.set_state(RotationState {
            status: RotationStatus::Running,
            ..self.state().await
        })
        .await?;

        let current = self.config_store.read_config().await?.ok_or(CoreError::ConfigMissing)?;
        let previous_kvno = Keytab::parse(&current.keytab)
            .ok()
            .and_then(|kt| kt.find_entry_for_principal(spn).map(|e| e.kvno))
            .unwrap_or(0);
        let backup = self.cfg.backup_enabled.then(|| current.keytab.clone());

        let attempt = self.attempt_rotation(spn, realm, &current.keytab, previous_kvno).await;
        let (new_kvno, new_bytes) = match attempt {
            Ok(pair) => pair,
            Err(err) => {
                self.fail_and_notify(spn, previous_kvno, 0, &err, now_sec).await;
                return Err(err);
            }
        };

        let mut updated = current;
        updated.keytab = new_bytes;
        if let Err(err) = self.config_store.write_config(updated).await {
            let persist_err = CoreError::RotationPersist(err.to_string());
            self.fail_and_notify(spn, previous_kvno, new_kvno, &persist_err, now_sec).await;
            return Err(persist_err);
        }

        let completed = RotationState {
            status: RotationStatus::Completed,
            last_check: Some(now_sec),
            last_rotation: Some(now_sec),
            next_rotation: Some(now_sec + self.cfg.rotation_threshold_sec as i64),
            last_error: None,
            password_age_sec: Some(0),
            kvno: Some(new_kvno),
        };
        self.set_state(completed.clone()).await?;
        self.observability.increment(counters::ROTATIONS_COMPLETED);

        self.notify(&RotationEvent {
            spn: spn.to_string(),
            previous_kvno,
            new_kvno,
            succeeded: true,
            detail: "rotation completed".into(),
        })
        .await;
        tracing::info!(previous_kvno, new_kvno, "rotation completed");

        Ok(RotationOutcome { state: completed, backup })
    }

    /// Runs generate -> validate as one retried unit, since a partial
    /// success (generated but failed self-test) must retry from the top
    /// rather than persist a keytab that never passed its own round-trip.
    async fn attempt_rotation(&self, spn: &str, realm: &str, _previous_keytab: &[u8], _previous_kvno: u32) -> CoreResult<(u32, Vec<u8>)> {
        let mut last_err = None;
        for attempt in 0..self.cfg.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(self.cfg.retry_delay_sec)).await;
            }

            let step_timeout = Duration::from_secs(self.cfg.step_timeout_sec);
            let generated = match tokio::time::timeout(step_timeout, self.generator.generate(spn, realm)).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(err)) => {
                    last_err = Some(err);
                    continue;
                }
                Err(_) => {
                    last_err = Some(CoreError::RotationGenerate("keytab generation timed out".into()));
                    continue;
                }
            };

            match self.validate_new_keytab(spn, &generated) {
                Ok(kvno) => return Ok((kvno, generated)),
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or(CoreError::RotationGenerate("rotation exhausted retries".into())))
    }

    /// Parses the freshly generated keytab, confirms it carries a usable
    /// entry for `spn`, and runs the SPNEGO self-test before the keytab is
    /// ever persisted.
    fn validate_new_keytab(&self, spn: &str, bytes: &[u8]) -> CoreResult<u32> {
        let kt = Keytab::parse(bytes).map_err(|e| CoreError::RotationValidate(e.to_string()))?;
        let entry = kt
            .find_entry_for_principal(spn)
            .ok_or_else(|| CoreError::RotationValidate(format!("generated keytab has no entry for {spn}")))?;
        if !entry.enctype.is_supported() {
            return Err(CoreError::RotationValidate("generated keytab uses an unsupported enctype".into()));
        }
        spnego::self_test_entry(entry)?;
        Ok(entry.kvno)
    }

    async fn fail_and_notify(&self, spn: &str, previous_kvno: u32, new_kvno: u32, err: &CoreError, now_sec: i64) {
        let failed = RotationState {
            status: RotationStatus::Failed,
            last_check: Some(now_sec),
            last_error: Some(err.to_string()),
            ..self.state().await
        };
        if let Err(persist_err) = self.set_state(failed).await {
            tracing::error!(error = %persist_err, "failed to persist rotation failure state");
        }
        self.observability.increment(counters::ROTATIONS_FAILED);
        tracing::error!(error = %err, "rotation failed");
        self.notify(&RotationEvent {
            spn: spn.to_string(),
            previous_kvno,
            new_kvno,
            succeeded: false,
            detail: err.to_string(),
        })
        .await;
    }

    async fn notify(&self, event: &RotationEvent) {
        if self.cfg.notification_endpoint.is_none() {
            return;
        }
        let _ = self.sink.notify(event).await;
    }
}

/// Awaits `fut` against `self.cfg.step_timeout_sec`, converting a timeout
/// into the caller-supplied error. Used by hosts that need a single step
/// (outside the generate/validate loop `attempt_rotation` already wraps)
/// bounded the same way.
impl RotationController {
    pub async fn with_step_timeout<T>(&self, fut: impl Future<Output = CoreResult<T>>, on_timeout: impl FnOnce(u64) -> CoreError) -> CoreResult<T> {
        match tokio::time::timeout(Duration::from_secs(self.cfg.step_timeout_sec), fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(self.cfg.step_timeout_sec)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::keytab::{tests::sample_keytab_bytes, EncType};
    use crate::normalize::NormalizationRules;
    use crate::rotation::collaborators::tests::{
        FailingKeytabGenerator, FixedAgeInspector, RecordingNotificationSink, StaticKeytabGenerator,
    };
    use crate::storage::InMemoryStorage;
    use std::sync::atomic::Ordering;

    const SPN: &str = "HTTP/vault.local.lab";
    const NOW: i64 = 1_753_000_000;

    async fn seeded_config_store() -> Arc<ConfigStore> {
        let store = Arc::new(ConfigStore::new(Arc::new(InMemoryStorage::new())));
        store
            .write_config(Configuration {
                realm: "LOCAL.LAB".into(),
                kdcs: vec!["addc.local.lab".into()],
                spn: SPN.into(),
                keytab: sample_keytab_bytes(SPN),
                allow_channel_binding: false,
                clock_skew_sec: 300,
                normalization: NormalizationRules::default(),
            })
            .await
            .unwrap();
        store
    }

    fn notifying_cfg(overrides: RotationConfig) -> RotationConfig {
        RotationConfig {
            notification_endpoint: Some("https://example.invalid/webhook".into()),
            ..overrides
        }
    }

    #[tokio::test]
    async fn successful_rotation_transitions_to_completed_and_notifies() {
        let store = seeded_config_store().await;
        let generator = Arc::new(StaticKeytabGenerator(crate::keytab::encode_single_entry_keytab(
            SPN,
            "LOCAL.LAB",
            2,
            EncType::AES256_CTS_HMAC_SHA1_96,
            &[3u8; 32],
        )));
        let sink = Arc::new(RecordingNotificationSink::new());
        let controller = RotationController::new(
            Arc::new(InMemoryStorage::new()),
            store.clone(),
            Arc::new(FixedAgeInspector(999_999)),
            generator,
            sink.clone(),
            Arc::new(ObservabilityRegistry::new()),
            notifying_cfg(RotationConfig {
                rotation_threshold_sec: 3600,
                ..RotationConfig::default()
            }),
        );

        let outcome = controller.rotate_with_backup(SPN, "LOCAL.LAB", NOW).await.unwrap();
        assert_eq!(outcome.state.status, RotationStatus::Completed);
        assert_eq!(outcome.state.kvno, Some(2));
        assert!(outcome.backup.is_some());
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);

        let persisted = store.read_config().await.unwrap().unwrap();
        let kt = Keytab::parse(&persisted.keytab).unwrap();
        assert_eq!(kt.find_entry_for_principal(SPN).unwrap().kvno, 2);
    }

    #[tokio::test]
    async fn password_too_young_skips_rotation() {
        let store = seeded_config_store().await;
        let generator = Arc::new(StaticKeytabGenerator(sample_keytab_bytes(SPN)));
        let sink = Arc::new(RecordingNotificationSink::new());
        let controller = RotationController::new(
            Arc::new(InMemoryStorage::new()),
            store,
            Arc::new(FixedAgeInspector(10)),
            generator,
            sink.clone(),
            Arc::new(ObservabilityRegistry::new()),
            RotationConfig {
                rotation_threshold_sec: 3600,
                backup_enabled: false,
                ..RotationConfig::default()
            },
        );

        let state = controller.maybe_rotate(SPN, "LOCAL.LAB", NOW).await.unwrap();
        assert_eq!(state.status, RotationStatus::Idle);
        assert_eq!(sink.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_rotation_never_touches_the_inspector() {
        let store = seeded_config_store().await;
        let controller = RotationController::new(
            Arc::new(InMemoryStorage::new()),
            store,
            Arc::new(FixedAgeInspector(999_999)),
            Arc::new(StaticKeytabGenerator(sample_keytab_bytes(SPN))),
            Arc::new(RecordingNotificationSink::new()),
            Arc::new(ObservabilityRegistry::new()),
            RotationConfig {
                enabled: false,
                ..RotationConfig::default()
            },
        );

        let state = controller.maybe_rotate(SPN, "LOCAL.LAB", NOW).await.unwrap();
        assert_eq!(state.status, RotationStatus::Idle);
        assert!(state.last_check.is_none());
    }

    #[tokio::test]
    async fn generator_failure_transitions_to_failed_and_notifies() {
        let store = seeded_config_store().await;
        let sink = Arc::new(RecordingNotificationSink::new());
        let controller = RotationController::new(
            Arc::new(InMemoryStorage::new()),
            store,
            Arc::new(FixedAgeInspector(999_999)),
            Arc::new(FailingKeytabGenerator),
            sink.clone(),
            Arc::new(ObservabilityRegistry::new()),
            notifying_cfg(RotationConfig {
                max_retries: 1,
                ..RotationConfig::default()
            }),
        );

        let err = controller.rotate_now(SPN, "LOCAL.LAB", NOW).await.unwrap_err();
        assert!(matches!(err, CoreError::RotationGenerate(_)));
        assert_eq!(controller.state().await.status, RotationStatus::Failed);
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn notification_is_skipped_without_an_endpoint_configured() {
        let store = seeded_config_store().await;
        let sink = Arc::new(RecordingNotificationSink::new());
        let controller = RotationController::new(
            Arc::new(InMemoryStorage::new()),
            store,
            Arc::new(FixedAgeInspector(999_999)),
            Arc::new(FailingKeytabGenerator),
            sink.clone(),
            Arc::new(ObservabilityRegistry::new()),
            RotationConfig {
                max_retries: 1,
                notification_endpoint: None,
                ..RotationConfig::default()
            },
        );

        let _ = controller.rotate_now(SPN, "LOCAL.LAB", NOW).await.unwrap_err();
        assert_eq!(sink.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generated_keytab_missing_spn_fails_validation() {
        let store = seeded_config_store().await;
        let generator = Arc::new(StaticKeytabGenerator(sample_keytab_bytes("HTTP/other.local.lab")));
        let sink = Arc::new(RecordingNotificationSink::new());
        let controller = RotationController::new(
            Arc::new(InMemoryStorage::new()),
            store,
            Arc::new(FixedAgeInspector(999_999)),
            generator,
            sink,
            Arc::new(ObservabilityRegistry::new()),
            RotationConfig {
                max_retries: 1,
                ..RotationConfig::default()
            },
        );

        let err = controller.rotate_now(SPN, "LOCAL.LAB", NOW).await.unwrap_err();
        assert!(matches!(err, CoreError::RotationValidate(_)));
    }

    #[tokio::test]
    async fn concurrent_rotation_attempt_is_rejected_as_busy() {
        let store = seeded_config_store().await;
        let generator = Arc::new(StaticKeytabGenerator(sample_keytab_bytes(SPN)));
        let sink = Arc::new(RecordingNotificationSink::new());
        let controller = Arc::new(RotationController::new(
            Arc::new(InMemoryStorage::new()),
            store,
            Arc::new(FixedAgeInspector(999_999)),
            generator,
            sink,
            Arc::new(ObservabilityRegistry::new()),
            RotationConfig::default(),
        ));

        let _held = controller.lock.try_lock().unwrap();
        let err = controller.rotate_now(SPN, "LOCAL.LAB", NOW).await.unwrap_err();
        assert!(matches!(err, CoreError::Busy));
    }

    #[tokio::test]
    async fn initialize_persists_default_state_on_first_start() {
        let store = seeded_config_store().await;
        let storage = Arc::new(InMemoryStorage::new());
        let controller = RotationController::new(
            storage.clone(),
            store,
            Arc::new(FixedAgeInspector(0)),
            Arc::new(StaticKeytabGenerator(sample_keytab_bytes(SPN))),
            Arc::new(RecordingNotificationSink::new()),
            Arc::new(ObservabilityRegistry::new()),
            RotationConfig::default(),
        );

        assert!(storage.get(ROTATION_STATE_KEY).await.unwrap().is_none());
        controller.initialize().await.unwrap();
        assert!(storage.get(ROTATION_STATE_KEY).await.unwrap().is_some());
        assert_eq!(controller.state().await.status, RotationStatus::Idle);
    }

    #[tokio::test]
    async fn initialize_loads_a_previously_persisted_state() {
        let store = seeded_config_store().await;
        let storage = Arc::new(InMemoryStorage::new());
        let persisted = RotationState {
            status: RotationStatus::Completed,
            kvno: Some(7),
            ..RotationState::default()
        };
        storage.put(ROTATION_STATE_KEY, serde_json::to_vec(&persisted).unwrap()).await.unwrap();

        let controller = RotationController::new(
            storage,
            store,
            Arc::new(FixedAgeInspector(0)),
            Arc::new(StaticKeytabGenerator(sample_keytab_bytes(SPN))),
            Arc::new(RecordingNotificationSink::new()),
            Arc::new(ObservabilityRegistry::new()),
            RotationConfig::default(),
        );

        controller.initialize().await.unwrap();
        assert_eq!(controller.state().await, persisted);
    }
}
