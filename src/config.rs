// [src/config.rs]
//! Config Store (component C2).
//!
//! Persists the singleton `Configuration` record behind the `Storage`
//! interface, the way `libs/infra/db-turso/src/repositories` pairs a
//! validate-then-persist sequence with a typed error on every write.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;
use crate::keytab::Keytab;
use crate::normalize::{self, NormalizationRules};
use crate::storage::Storage;

const CONFIG_KEY: &str = "config";
const MAX_CLOCK_SKEW_SEC: i64 = 3600;
const DEFAULT_CLOCK_SKEW_SEC: i64 = 300;

/// The global backend configuration (§3), singleton at key `config`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Configuration {
    pub realm: String,
    pub kdcs: Vec<String>,
    pub spn: String,
    /// Raw keytab bytes (already base64-decoded). Never returned from
    /// `read_config` directly — see [`ConfigView`].
    pub keytab: Vec<u8>,
    pub allow_channel_binding: bool,
    pub clock_skew_sec: i64,
    pub normalization: NormalizationRules,
}

/// Redacted projection of [`Configuration`] safe to return from the config
/// read endpoint: the keytab is replaced by its SHA-256 fingerprint (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigView {
    pub realm: String,
    pub kdcs: Vec<String>,
    pub spn: String,
    pub keytab_fingerprint: String,
    pub allow_channel_binding: bool,
    pub clock_skew_sec: i64,
    pub normalization: NormalizationRules,
}

pub fn keytab_fingerprint(keytab: &[u8]) -> String {
    let digest = Sha256::digest(keytab);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl From<&Configuration> for ConfigView {
    fn from(cfg: &Configuration) -> Self {
        ConfigView {
            realm: cfg.realm.clone(),
            kdcs: cfg.kdcs.clone(),
            spn: cfg.spn.clone(),
            keytab_fingerprint: keytab_fingerprint(&cfg.keytab),
            allow_channel_binding: cfg.allow_channel_binding,
            clock_skew_sec: cfg.clock_skew_sec,
            normalization: cfg.normalization.clone(),
        }
    }
}

fn validate_kdc_entry(entry: &str) -> Result<(), CoreError> {
    if entry.is_empty() {
        return Err(CoreError::ConfigInvalid("empty KDC entry".into()));
    }
    if let Some((host, port)) = entry.split_once(':') {
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(CoreError::ConfigInvalid(format!("malformed KDC entry '{entry}'")));
        }
    }
    Ok(())
}

/// Runs §3's field-level validation plus the cross-field invariant that the
/// keytab must contain an entry matching `spn` under a supported enctype.
fn validate_configuration(cfg: &Configuration) -> Result<(), CoreError> {
    if cfg.realm.trim().is_empty() {
        return Err(CoreError::ConfigInvalid("realm must not be empty".into()));
    }
    let normalized_realm = normalize::normalize_realm(&cfg.realm, &cfg.normalization)?;
    if normalized_realm != cfg.realm {
        return Err(CoreError::ConfigInvalid(
            "realm must already be in normalized (uppercase) form on write".into(),
        ));
    }

    if cfg.kdcs.is_empty() {
        return Err(CoreError::ConfigInvalid("kdcs must contain at least one entry".into()));
    }
    for kdc in &cfg.kdcs {
        validate_kdc_entry(kdc)?;
    }

    normalize::normalize_spn(&cfg.spn, &cfg.normalization)?;

    if cfg.clock_skew_sec < 0 || cfg.clock_skew_sec > MAX_CLOCK_SKEW_SEC {
        return Err(CoreError::ConfigInvalid(format!(
            "clock_skew_sec {} out of bounds [0, {MAX_CLOCK_SKEW_SEC}]",
            cfg.clock_skew_sec
        )));
    }

    let keytab = Keytab::parse(&cfg.keytab)
        .map_err(|e| CoreError::ConfigInvalid(format!("keytab does not parse: {e}")))?;
    if keytab.find_entry_for_principal(&cfg.spn).is_none() {
        return Err(CoreError::ConfigInvalid(format!(
            "keytab contains no entry for spn '{}'",
            cfg.spn
        )));
    }
    if !keytab.entries.iter().any(|e| e.enctype.is_supported()) {
        return Err(CoreError::ConfigInvalid(
            "keytab contains no entry with a supported encryption type".into(),
        ));
    }

    Ok(())
}

/// Default clock skew tolerance applied when a configuration omits one.
pub fn default_clock_skew_sec() -> i64 {
    DEFAULT_CLOCK_SKEW_SEC
}

pub struct ConfigStore {
    storage: Arc<dyn Storage>,
}

impl ConfigStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    #[tracing::instrument(skip(self, cfg))]
    pub async fn write_config(&self, cfg: Configuration) -> Result<(), CoreError> {
        validate_configuration(&cfg)?;
        let serialized = serde_json::to_vec(&cfg)
            .map_err(|e| CoreError::ConfigInvalid(format!("serialization failed: {e}")))?;
        crate::storage::with_retry(|| {
            let storage = self.storage.clone();
            let serialized = serialized.clone();
            async move { storage.put(CONFIG_KEY, serialized).await }
        })
        .await?;
        tracing::info!("configuration written");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn read_config(&self) -> Result<Option<Configuration>, CoreError> {
        let raw = crate::storage::with_retry(|| {
            let storage = self.storage.clone();
            async move { storage.get(CONFIG_KEY).await }
        })
        .await?;

        match raw {
            None => Ok(None),
            Some(bytes) => {
                let cfg: Configuration = serde_json::from_slice(&bytes)
                    .map_err(|e| CoreError::Storage(format!("config record corrupt: {e}")))?;
                Ok(Some(cfg))
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_config(&self) -> Result<(), CoreError> {
        crate::storage::with_retry(|| {
            let storage = self.storage.clone();
            async move { storage.delete(CONFIG_KEY).await }
        })
        .await
    }
}
