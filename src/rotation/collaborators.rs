// [src/rotation/collaborators.rs]
//! External collaborators the rotation controller depends on (§4.9/§9):
//! the directory it inspects for gMSA password age, the generator that
//! mints a fresh keytab, and the sink notified once rotation completes.
//! How a new keytab's key material is actually obtained (gMSA password
//! extraction vs. a helper process) is deliberately left open — this crate
//! does not pick a side, it only defines the seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Queried by the rotation controller's age monitor to decide whether a
/// gMSA's current password is old enough to warrant rotating the keytab.
#[async_trait]
pub trait DomainInspector: Send + Sync {
    /// Seconds since the gMSA's managed password was last changed in the
    /// directory, for the account backing `spn`.
    async fn password_age_sec(&self, spn: &str) -> Result<u64, CoreError>;
}

/// Produces fresh keytab bytes for `spn`/`realm`. Left abstract per §9 —
/// a real implementation might shell out to a helper process holding the
/// gMSA's managed password, or call into a directory-integration API.
#[async_trait]
pub trait KeytabGenerator: Send + Sync {
    async fn generate(&self, spn: &str, realm: &str) -> Result<Vec<u8>, CoreError>;
}

/// Delivered once a rotation cycle completes (successfully or not), at
/// most once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RotationEvent {
    pub spn: String,
    pub previous_kvno: u32,
    pub new_kvno: u32,
    pub succeeded: bool,
    pub detail: String,
}

impl RotationEvent {
    /// SHA-256 over the canonical JSON payload, included alongside the
    /// event so a receiver can detect in-flight tampering without this
    /// crate needing to hold a signing key of its own.
    pub fn payload_digest(&self) -> Result<String, CoreError> {
        let bytes = serde_json::to_vec(self).map_err(|e| CoreError::RotationPersist(format!("event serialization failed: {e}")))?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &RotationEvent) -> Result<(), CoreError>;
}

/// No-op sink for hosts that don't wire up rotation notifications.
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn notify(&self, _event: &RotationEvent) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Default HTTP sink: POSTs the event (plus its digest) as JSON, at most
/// once per cycle, the same "signed JSON webhook" shape described in §4.9.
#[cfg(feature = "http-notify")]
pub struct HttpNotificationSink {
    client: reqwest::Client,
    webhook_url: String,
}

#[cfg(feature = "http-notify")]
impl HttpNotificationSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }
}

#[cfg(feature = "http-notify")]
#[derive(Serialize)]
struct NotificationPayload<'a> {
    #[serde(flatten)]
    event: &'a RotationEvent,
    digest: String,
}

#[cfg(feature = "http-notify")]
#[async_trait]
impl NotificationSink for HttpNotificationSink {
    #[tracing::instrument(skip(self, event), fields(spn = %event.spn))]
    async fn notify(&self, event: &RotationEvent) -> Result<(), CoreError> {
        let digest = event.payload_digest()?;
        let payload = NotificationPayload { event, digest };
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CoreError::RotationPersist(format!("notification delivery failed: {e}")))?
            .error_for_status()
            .map_err(|e| CoreError::RotationPersist(format!("notification endpoint returned an error: {e}")))?;
        tracing::info!("rotation notification delivered");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    pub(crate) struct FixedAgeInspector(pub(crate) u64);

    #[async_trait]
    impl DomainInspector for FixedAgeInspector {
        async fn password_age_sec(&self, _spn: &str) -> Result<u64, CoreError> {
            Ok(self.0)
        }
    }

    pub(crate) struct StaticKeytabGenerator(pub(crate) Vec<u8>);

    #[async_trait]
    impl KeytabGenerator for StaticKeytabGenerator {
        async fn generate(&self, _spn: &str, _realm: &str) -> Result<Vec<u8>, CoreError> {
            Ok(self.0.clone())
        }
    }

    pub(crate) struct FailingKeytabGenerator;

    #[async_trait]
    impl KeytabGenerator for FailingKeytabGenerator {
        async fn generate(&self, _spn: &str, _realm: &str) -> Result<Vec<u8>, CoreError> {
            Err(CoreError::RotationGenerate("helper process unavailable".into()))
        }
    }

    pub(crate) struct RecordingNotificationSink {
        pub(crate) count: AtomicU64,
        pub(crate) last: Mutex<Option<RotationEvent>>,
    }

    impl RecordingNotificationSink {
        pub(crate) fn new() -> Self {
            Self { count: AtomicU64::new(0), last: Mutex::new(None) }
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingNotificationSink {
        async fn notify(&self, event: &RotationEvent) -> Result<(), CoreError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().expect("notification mutex poisoned") = Some(event.clone());
            Ok(())
        }
    }

    #[test]
    fn payload_digest_is_stable_for_identical_events() {
        let event = RotationEvent {
            spn: "HTTP/vault.local.lab".into(),
            previous_kvno: 1,
            new_kvno: 2,
            succeeded: true,
            detail: "ok".into(),
        };
        assert_eq!(event.payload_digest().unwrap(), event.clone().payload_digest().unwrap());
    }

    #[tokio::test]
    async fn null_sink_always_succeeds() {
        let sink = NullNotificationSink;
        let event = RotationEvent {
            spn: "HTTP/vault.local.lab".into(),
            previous_kvno: 1,
            new_kvno: 2,
            succeeded: true,
            detail: "ok".into(),
        };
        assert!(sink.notify(&event).await.is_ok());
    }
}
