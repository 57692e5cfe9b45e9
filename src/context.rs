// [src/context.rs]
//! Composition root.
//!
//! Design Notes §9: "Global mutable state is expressed as a single
//! `CoreContext` value passed explicitly" — no hidden singletons, no
//! `lazy_static`/`OnceCell` globals anywhere in this crate. Grounded on
//! `AppState` in `src/state/mod.rs`: one struct holding
//! `Arc`s to every subsystem, constructed once via `::new` and handed to
//! every caller that needs it.

use std::sync::Arc;

use uuid::Uuid;

use crate::authz::{self, AuthzDecision};
use crate::config::ConfigStore;
use crate::error::{CoreError, CoreResult};
use crate::keytab::Keytab;
use crate::normalize::NormalizationRules;
use crate::observability::{counters, HealthSnapshot, ObservabilityRegistry};
use crate::role::RoleStore;
use crate::rotation::collaborators::{DomainInspector, KeytabGenerator, NotificationSink};
use crate::rotation::{RotationConfig, RotationController, RotationState};
use crate::spnego::SpnegoValidator;
use crate::storage::Storage;

pub struct CoreContext {
    pub config_store: Arc<ConfigStore>,
    pub role_store: Arc<RoleStore>,
    pub spnego_validator: Arc<SpnegoValidator>,
    pub rotation: Arc<RotationController>,
    pub observability: Arc<ObservabilityRegistry>,
}

impl CoreContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        clock_skew_sec: i64,
        inspector: Arc<dyn DomainInspector>,
        generator: Arc<dyn KeytabGenerator>,
        sink: Arc<dyn NotificationSink>,
        rotation_cfg: RotationConfig,
    ) -> Self {
        let config_store = Arc::new(ConfigStore::new(storage.clone()));
        let role_store = Arc::new(RoleStore::new(storage.clone()));
        let observability = Arc::new(ObservabilityRegistry::new());
        let rotation = Arc::new(RotationController::new(
            storage,
            config_store.clone(),
            inspector,
            generator,
            sink,
            observability.clone(),
            rotation_cfg,
        ));

        Self {
            config_store,
            role_store,
            spnego_validator: Arc::new(SpnegoValidator::new(clock_skew_sec)),
            rotation,
            observability,
        }
    }

    /// Loads any persisted rotation state, establishing the record on disk
    /// the first time this context is ever started. Hosts call this once
    /// after construction.
    pub async fn initialize(&self) -> CoreResult<()> {
        self.rotation.initialize().await
    }

    /// Runs the rotation controller's age check/rotate cycle against the
    /// wall clock, the entry point a host's scheduler calls on a timer.
    pub async fn run_rotation_check(&self, spn: &str, realm: &str) -> CoreResult<RotationState> {
        self.rotation.maybe_rotate(spn, realm, chrono::Utc::now().timestamp()).await
    }

    /// End-to-end login: decode + validate the SPNEGO token against the
    /// stored keytab, load the requested role, and run the authorization
    /// decision — the full happy-path sequence of §8's literal scenarios.
    /// Every call is tagged with a fresh correlation id for the tracing
    /// span, satisfying §6/§10's per-request correlation requirement.
    #[tracing::instrument(skip(self, token_b64, channel_binding), fields(correlation_id = %Uuid::new_v4(), role = %role_name))]
    pub async fn authenticate(
        &self,
        token_b64: &str,
        role_name: &str,
        channel_binding: Option<&[u8]>,
        now_usec: i64,
    ) -> CoreResult<AuthzDecision> {
        self.observability.increment(counters::AUTH_ATTEMPTS);

        let result = self.authenticate_inner(token_b64, role_name, channel_binding, now_usec).await;
        match &result {
            Ok(_) => self.observability.increment(counters::AUTH_SUCCESSES),
            Err(err) => {
                self.observability.increment(counters::AUTH_DENIALS);
                self.observability.increment(counters::auth_failure_by_kind(err.kind()));
                match err {
                    CoreError::Replay => self.observability.increment(counters::REPLAY_REJECTIONS),
                    CoreError::PacMissing => self.observability.increment(counters::PAC_MISSING),
                    CoreError::PacInvalid(_) => self.observability.increment(counters::PAC_INVALID),
                    _ => {}
                }
            }
        }
        result
    }

    async fn authenticate_inner(
        &self,
        token_b64: &str,
        role_name: &str,
        channel_binding: Option<&[u8]>,
        now_usec: i64,
    ) -> CoreResult<AuthzDecision> {
        let config = self.config_store.read_config().await?.ok_or(CoreError::ConfigMissing)?;
        let keytab = Keytab::parse(&config.keytab).map_err(|e| CoreError::ConfigInvalid(e.to_string()))?;

        let binding = if config.allow_channel_binding { channel_binding } else { None };
        let identity = self.spnego_validator.validate(token_b64, &keytab, &config.spn, binding, now_usec)?;

        let role = self
            .role_store
            .read(role_name)
            .await?
            .ok_or_else(|| CoreError::RoleNotFound(role_name.to_string()))?;

        authz::authorize(&identity, &role, &config.spn, &config.normalization)
    }

    /// Assembles the read-only health/status surface §10 describes:
    /// counters plus a glance at whether config is present, rotation is
    /// enabled, and what the keytab's current kvno is.
    pub async fn health_snapshot(&self) -> CoreResult<HealthSnapshot> {
        let config = self.config_store.read_config().await?;
        let rotation_state = self.rotation.state().await;
        let keytab_kvno = config
            .as_ref()
            .and_then(|c| Keytab::parse(&c.keytab).ok().and_then(|kt| kt.find_entry_for_principal(&c.spn).map(|e| e.kvno)));

        Ok(HealthSnapshot {
            counters: self.observability.counters_snapshot(),
            config_present: config.is_some(),
            rotation_enabled: self.rotation.is_enabled(),
            rotation_status: format!("{:?}", rotation_state.status),
            last_rotation: rotation_state.last_rotation,
            keytab_kvno,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::keytab::{tests::sample_keytab_bytes, EncType};
    use crate::pac;
    use crate::role::tests::sample_role;
    use crate::rotation::collaborators::NullNotificationSink;
    use crate::spnego::tests::mint_token;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;

    const SPN: &str = "HTTP/vault.local.lab";

    struct StubInspector;
    #[async_trait]
    impl DomainInspector for StubInspector {
        async fn password_age_sec(&self, _spn: &str) -> CoreResult<u64> {
            Ok(0)
        }
    }

    struct StubGenerator;
    #[async_trait]
    impl KeytabGenerator for StubGenerator {
        async fn generate(&self, spn: &str, realm: &str) -> CoreResult<Vec<u8>> {
            Ok(crate::keytab::encode_single_entry_keytab(
                spn,
                realm,
                1,
                EncType::AES256_CTS_HMAC_SHA1_96,
                &[1u8; 32],
            ))
        }
    }

    async fn context_with_config() -> (CoreContext, crate::keytab::KeytabEntry) {
        let storage = Arc::new(InMemoryStorage::new());
        let ctx = CoreContext::new(
            storage,
            300,
            Arc::new(StubInspector),
            Arc::new(StubGenerator),
            Arc::new(NullNotificationSink),
            RotationConfig::default(),
        );

        let keytab_bytes = sample_keytab_bytes(SPN);
        let entry = Keytab::parse(&keytab_bytes).unwrap().entries[0].clone();
        ctx.config_store
            .write_config(Configuration {
                realm: "LOCAL.LAB".into(),
                kdcs: vec!["addc.local.lab".into()],
                spn: SPN.into(),
                keytab: keytab_bytes,
                allow_channel_binding: false,
                clock_skew_sec: 300,
                normalization: NormalizationRules::default(),
            })
            .await
            .unwrap();
        ctx.role_store.upsert(sample_role("vault-agent"), &NormalizationRules::default()).await.unwrap();

        (ctx, entry)
    }

    #[tokio::test]
    async fn end_to_end_authentication_grants_role_policies() {
        let (ctx, entry) = context_with_config().await;
        let pac_bytes = pac::encode_pac(&pac::tests::sample_logon_info(), &entry.key);
        let token = mint_token(&entry, "svc-account@LOCAL.LAB", 1_753_000_000_000_000, None, Some(pac_bytes));

        let decision = ctx
            .authenticate(&token, "vault-agent", None, 1_753_000_000_000_000)
            .await
            .unwrap();
        assert_eq!(decision.role, "vault-agent");
        assert_eq!(ctx.observability.get(counters::AUTH_SUCCESSES), 1);
    }

    #[tokio::test]
    async fn unknown_role_is_reported_distinctly_from_authn_failure() {
        let (ctx, entry) = context_with_config().await;
        let pac_bytes = pac::encode_pac(&pac::tests::sample_logon_info(), &entry.key);
        let token = mint_token(&entry, "svc-account@LOCAL.LAB", 1_753_000_000_000_000, None, Some(pac_bytes));

        let err = ctx
            .authenticate(&token, "does-not-exist", None, 1_753_000_000_000_000)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RoleNotFound(_)));
        assert_eq!(ctx.observability.get(counters::AUTH_DENIALS), 1);
        assert_eq!(ctx.observability.get(counters::auth_failure_by_kind(err.kind())), 1);
    }

    #[tokio::test]
    async fn missing_config_is_reported_before_touching_spnego() {
        let storage = Arc::new(InMemoryStorage::new());
        let ctx = CoreContext::new(
            storage,
            300,
            Arc::new(StubInspector),
            Arc::new(StubGenerator),
            Arc::new(NullNotificationSink),
            RotationConfig::default(),
        );
        let err = ctx.authenticate("not-a-real-token", "vault-agent", None, 0).await.unwrap_err();
        assert!(matches!(err, CoreError::ConfigMissing));
    }

    #[tokio::test]
    async fn health_snapshot_reports_config_and_rotation_state() {
        let (ctx, _entry) = context_with_config().await;
        ctx.initialize().await.unwrap();
        let snapshot = ctx.health_snapshot().await.unwrap();
        assert!(snapshot.config_present);
        assert!(snapshot.rotation_enabled);
        assert_eq!(snapshot.keytab_kvno, Some(1));
    }
}
