// [src/role.rs]
//! Role Store (component C3).
//!
//! CRUD for role records under the `role/` key prefix, mirroring the
//! repository pattern in `libs/infra/db-turso/src/repositories`: one struct
//! per aggregate, constructed with a storage handle, validating on every
//! write before it ever reaches the backing store.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::normalize::{self, NormalizationRules};
use crate::storage::Storage;

const ROLE_PREFIX: &str = "role/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Default,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Union,
    Intersection,
}

/// A named authorization record (§3). Immutable from the core's view
/// between reads — updates are whole-record replacements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleRecord {
    pub name: String,
    pub allowed_realms: BTreeSet<String>,
    pub allowed_spns: BTreeSet<String>,
    pub bound_group_sids: BTreeSet<String>,
    pub deny_group_sids: BTreeSet<String>,
    pub token_policies: BTreeSet<String>,
    pub deny_policies: BTreeSet<String>,
    pub token_type: TokenType,
    pub period: u32,
    pub max_ttl: u32,
    pub merge_strategy: MergeStrategy,
}

const MAX_TTL_UPPER_BOUND: u32 = 86_400;

fn validate_role(role: &RoleRecord, norm: &NormalizationRules) -> Result<(), CoreError> {
    normalize::validate_role_name(&role.name)?;

    for realm in &role.allowed_realms {
        normalize::normalize_realm(realm, norm)?;
    }
    for spn in &role.allowed_spns {
        normalize::normalize_spn(spn, norm)?;
    }
    for sid in role.bound_group_sids.iter().chain(role.deny_group_sids.iter()) {
        normalize::validate_sid(sid)?;
    }

    if !role.bound_group_sids.is_disjoint(&role.deny_group_sids) {
        return Err(CoreError::ConfigInvalid(
            "bound_group_sids and deny_group_sids must be disjoint".into(),
        ));
    }

    if role.period > MAX_TTL_UPPER_BOUND {
        return Err(CoreError::ConfigInvalid(format!(
            "period {} exceeds upper bound {MAX_TTL_UPPER_BOUND}",
            role.period
        )));
    }
    if role.max_ttl > MAX_TTL_UPPER_BOUND {
        return Err(CoreError::ConfigInvalid(format!(
            "max_ttl {} exceeds upper bound {MAX_TTL_UPPER_BOUND}",
            role.max_ttl
        )));
    }
    if role.period > 0 && role.max_ttl > 0 && role.period > role.max_ttl {
        return Err(CoreError::ConfigInvalid("period must not exceed max_ttl".into()));
    }

    Ok(())
}

/// Canonicalizes every realm/SPN in a role the way `upsert` does, so
/// `upsert_role(r); read_role(r.name) == canonical(r)` holds (§8).
fn canonicalize(mut role: RoleRecord, norm: &NormalizationRules) -> Result<RoleRecord, CoreError> {
    role.allowed_realms = role
        .allowed_realms
        .iter()
        .map(|r| normalize::normalize_realm(r, norm))
        .collect::<Result<BTreeSet<_>, _>>()?;
    role.allowed_spns = role
        .allowed_spns
        .iter()
        .map(|s| normalize::normalize_spn(s, norm))
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(role)
}

pub struct RoleStore {
    storage: Arc<dyn Storage>,
}

impl RoleStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn key(name: &str) -> String {
        format!("{ROLE_PREFIX}{name}")
    }

    #[tracing::instrument(skip(self, role, norm))]
    pub async fn upsert(&self, role: RoleRecord, norm: &NormalizationRules) -> Result<(), CoreError> {
        validate_role(&role, norm)?;
        let canonical = canonicalize(role, norm)?;
        let key = Self::key(&canonical.name);
        let serialized = serde_json::to_vec(&canonical)
            .map_err(|e| CoreError::ConfigInvalid(format!("role serialization failed: {e}")))?;
        crate::storage::with_retry(|| {
            let storage = self.storage.clone();
            let key = key.clone();
            let serialized = serialized.clone();
            async move { storage.put(&key, serialized).await }
        })
        .await?;
        tracing::info!(role = %canonical.name, "role upserted");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn read(&self, name: &str) -> Result<Option<RoleRecord>, CoreError> {
        let key = Self::key(name);
        let raw = crate::storage::with_retry(|| {
            let storage = self.storage.clone();
            let key = key.clone();
            async move { storage.get(&key).await }
        })
        .await?;
        match raw {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| CoreError::Storage(format!("role record corrupt: {e}")))?,
            )),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<String>, CoreError> {
        let keys = crate::storage::with_retry(|| {
            let storage = self.storage.clone();
            async move { storage.list(ROLE_PREFIX).await }
        })
        .await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(ROLE_PREFIX).map(str::to_string))
            .collect())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<(), CoreError> {
        let key = Self::key(name);
        crate::storage::with_retry(|| {
            let storage = self.storage.clone();
            let key = key.clone();
            async move { storage.delete(&key).await }
        })
        .await
    }
}
