// [src/spnego.rs]
//! SPNEGO Validator (component C5).
//!
//! Unwraps the outer SPNEGO `NegTokenInit` envelope and gates on the
//! Kerberos v5 mechanism OID, decrypts the inner AP-REQ using the keytab
//! entry matching the ticket's service principal + enctype + kvno,
//! enforces clock skew and replay protection, optionally verifies channel
//! binding, and hands the authorization-data payload to [`crate::pac`] to
//! recover group membership. A missing PAC is not rejected here — it is
//! recorded on the identity and left to [`crate::authz::authorize`] to
//! decide whether the requested role can tolerate it. Output is the
//! ephemeral [`ValidatedIdentity`] record — never persisted, never logged
//! with secret material attached.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use tracing::instrument;

use crate::der::{self, TAG_INTEGER, TAG_OCTET_STRING, TAG_OID, TAG_SEQUENCE};
use crate::error::{CoreError, CoreResult};
use crate::keytab::{EncType, Keytab, KeytabEntry};
use crate::pac;

/// Decoded token must fall within this range; outside it, the token is
/// rejected before any cryptography is attempted.
const MIN_TOKEN_LEN: usize = 32;
const MAX_TOKEN_LEN: usize = 64 * 1024;

const SHARD_COUNT: usize = 16;
const SHARD_CAPACITY: usize = 4096;

/// DER encoding of the Kerberos v5 mechanism OID `1.2.840.113554.1.2.2`,
/// the only mechanism this validator accepts inside a SPNEGO token.
const KRB5_MECH_OID: [u8; 9] = [0x2A, 0x86, 0x48, 0x86, 0xF7, 0x12, 0x01, 0x02, 0x02];

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// The fully verified outcome of a SPNEGO exchange, consumed by the
/// authorization engine. Deliberately not `Serialize` — this is an
/// in-process handoff value, never a wire or storage type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedIdentity {
    pub principal: String,
    pub realm: String,
    /// Service principal the ticket was issued for, as presented on the
    /// wire (not yet normalized — [`crate::authz::authorize`] does that).
    pub spn: String,
    pub kvno: u32,
    pub group_sids: BTreeSet<String>,
    /// Whether the AP-REQ carried a non-empty PAC. `false` means
    /// `group_sids` is empty by construction, not because the identity
    /// genuinely has no group memberships.
    pub has_pac: bool,
}

/// Sharded, lock-striped bounded replay cache keyed on
/// `(principal, authenticator ctime)`. Entries age out once they fall
/// outside the `2 * clock_skew_sec` window the authenticator could ever
/// legally fall in, so the cache never grows unbounded even without an
/// external reaper.
struct ReplayCache {
    shards: Vec<Mutex<HashMap<(String, i64), i64>>>,
}

impl ReplayCache {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, principal: &str) -> &Mutex<HashMap<(String, i64), i64>> {
        let mut hash: u64 = 1469598103934665603;
        for b in principal.as_bytes() {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        &self.shards[(hash as usize) % self.shards.len()]
    }

    /// Returns `true` if this `(principal, ctime_usec)` pair is new and has
    /// been recorded; `false` if it was already seen (a replay).
    fn observe(&self, principal: &str, ctime_usec: i64, now_usec: i64, window_usec: i64) -> bool {
        let mut shard = self.shard_for(principal).lock().expect("replay shard mutex poisoned");
        shard.retain(|_, seen_at| (now_usec - *seen_at).abs() <= window_usec);

        let key = (principal.to_string(), ctime_usec);
        if shard.contains_key(&key) {
            return false;
        }
        if shard.len() >= SHARD_CAPACITY {
            // Bounded: drop the oldest entry in this shard rather than grow.
            if let Some(oldest_key) = shard.iter().min_by_key(|(_, seen_at)| **seen_at).map(|(k, _)| k.clone()) {
                shard.remove(&oldest_key);
            }
        }
        shard.insert(key, now_usec);
        true
    }
}

pub struct SpnegoValidator {
    clock_skew_sec: i64,
    replay: ReplayCache,
}

impl SpnegoValidator {
    pub fn new(clock_skew_sec: i64) -> Self {
        Self {
            clock_skew_sec,
            replay: ReplayCache::new(),
        }
    }

    /// Validates a base64 SPNEGO token against `keytab`, returning the
    /// recovered identity on success. `channel_binding` is verified only
    /// when the caller supplies an expectation (§4 treats it as optional).
    #[instrument(skip(self, token_b64, keytab, channel_binding), fields(expected_spn = %expected_spn))]
    pub fn validate(
        &self,
        token_b64: &str,
        keytab: &Keytab,
        expected_spn: &str,
        channel_binding: Option<&[u8]>,
        now_usec: i64,
    ) -> CoreResult<ValidatedIdentity> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token_b64.trim())
            .map_err(|e| CoreError::InvalidSpnego(format!("base64 decode failed: {e}")))?;

        if decoded.len() < MIN_TOKEN_LEN || decoded.len() > MAX_TOKEN_LEN {
            return Err(CoreError::InvalidSpnego(format!(
                "decoded token length {} outside [{MIN_TOKEN_LEN}, {MAX_TOKEN_LEN}]",
                decoded.len()
            )));
        }

        let ap_req_bytes = decode_spnego_token(&decoded)?;
        let ap_req = decode_ap_req(&ap_req_bytes).map_err(|e| CoreError::InvalidSpnego(e.to_string()))?;

        if ap_req.sname != expected_spn {
            return Err(CoreError::KerberosFailed(format!(
                "ticket service principal {} does not match expected {expected_spn}",
                ap_req.sname
            )));
        }

        // Strict kvno match: a stale or mismatched kvno must fail, never
        // silently fall back to whatever key happens to be newest.
        let entry = keytab
            .find_entry(&ap_req.sname, ap_req.enctype)
            .filter(|e| e.kvno == ap_req.kvno)
            .ok_or_else(|| {
                CoreError::KerberosFailed(format!("no keytab entry for {} / kvno {}", ap_req.sname, ap_req.kvno))
            })?;

        let plaintext = decrypt_authenticator(&ap_req, entry).map_err(|e| CoreError::KerberosFailed(e.to_string()))?;
        let authenticator = decode_authenticator(&plaintext).map_err(|e| CoreError::InvalidSpnego(e.to_string()))?;

        let offset_sec = (now_usec - authenticator.ctime_usec) / 1_000_000;
        if offset_sec.abs() > self.clock_skew_sec {
            return Err(CoreError::ClockSkew {
                offset_sec,
                tolerance_sec: self.clock_skew_sec,
            });
        }

        let window_usec = 2 * self.clock_skew_sec * 1_000_000;
        if !self.replay.observe(&authenticator.cname, authenticator.ctime_usec, now_usec, window_usec) {
            return Err(CoreError::Replay);
        }

        if let Some(expected_binding) = channel_binding {
            if authenticator.channel_binding.as_deref() != Some(expected_binding) {
                return Err(CoreError::ChannelBinding);
            }
        }

        let (group_sids, has_pac) = match &authenticator.pac {
            Some(pac_bytes) if !pac_bytes.is_empty() => {
                let info = pac::parse_and_verify(pac_bytes, &entry.key).map_err(|e| CoreError::PacInvalid(e.to_string()))?;
                (info.group_sids(), true)
            }
            _ => (BTreeSet::new(), false),
        };

        Ok(ValidatedIdentity {
            principal: authenticator.cname,
            realm: ap_req.crealm,
            spn: ap_req.sname,
            kvno: ap_req.kvno,
            group_sids,
            has_pac,
        })
    }
}

struct ApReq {
    sname: String,
    crealm: String,
    kvno: u32,
    enctype: EncType,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
}

struct Authenticator {
    cname: String,
    ctime_usec: i64,
    channel_binding: Option<Vec<u8>>,
    pac: Option<Vec<u8>>,
}

/// Strips the outer SPNEGO `SEQUENCE { mechanism OID, inner-token OCTET
/// STRING }` envelope and rejects anything but the Kerberos v5 mechanism.
/// A real `NegTokenInit` carries a `MechTypeList`; this crate only ever
/// issues and accepts single-mechanism tokens, so one OID is sufficient.
fn decode_spnego_token(buf: &[u8]) -> Result<Vec<u8>, CoreError> {
    let outer = der::expect_tag(buf, TAG_SEQUENCE).map_err(|e| CoreError::InvalidSpnego(e.to_string()))?;
    let oid_tlv = der::expect_tag(outer.value, TAG_OID).map_err(|e| CoreError::InvalidSpnego(e.to_string()))?;
    if oid_tlv.value != KRB5_MECH_OID {
        return Err(CoreError::InvalidSpnego(
            "unsupported SPNEGO mechanism, only Kerberos v5 is accepted".into(),
        ));
    }
    let ap_req_tlv = der::expect_tag(oid_tlv.rest, TAG_OCTET_STRING).map_err(|e| CoreError::InvalidSpnego(e.to_string()))?;
    Ok(ap_req_tlv.value.to_vec())
}

fn encode_spnego_token(ap_req_bytes: &[u8]) -> Vec<u8> {
    der::encode_sequence(&[
        der::encode_tlv(TAG_OID, &KRB5_MECH_OID),
        der::encode_tlv(TAG_OCTET_STRING, ap_req_bytes),
    ])
}

fn decode_ap_req(buf: &[u8]) -> Result<ApReq, der::DerError> {
    let outer = der::expect_tag(buf, TAG_SEQUENCE)?;
    let sname_tlv = der::expect_tag(outer.value, TAG_OCTET_STRING)?;
    let crealm_tlv = der::expect_tag(sname_tlv.rest, TAG_OCTET_STRING)?;
    let kvno_tlv = der::expect_tag(crealm_tlv.rest, TAG_INTEGER)?;
    let enctype_tlv = der::expect_tag(kvno_tlv.rest, TAG_INTEGER)?;
    let iv_tlv = der::expect_tag(enctype_tlv.rest, TAG_OCTET_STRING)?;
    let ciphertext_tlv = der::expect_tag(iv_tlv.rest, TAG_OCTET_STRING)?;

    Ok(ApReq {
        sname: String::from_utf8_lossy(sname_tlv.value).into_owned(),
        crealm: String::from_utf8_lossy(crealm_tlv.value).into_owned(),
        kvno: der::decode_u32(kvno_tlv.value),
        enctype: EncType(der::decode_u32(enctype_tlv.value) as u16),
        iv: iv_tlv.value.to_vec(),
        ciphertext: ciphertext_tlv.value.to_vec(),
    })
}

fn encode_ap_req(ap_req: &ApReq) -> Vec<u8> {
    der::encode_sequence(&[
        der::encode_tlv(TAG_OCTET_STRING, ap_req.sname.as_bytes()),
        der::encode_tlv(TAG_OCTET_STRING, ap_req.crealm.as_bytes()),
        der::encode_u32(TAG_INTEGER, ap_req.kvno),
        der::encode_u32(TAG_INTEGER, ap_req.enctype.0 as u32),
        der::encode_tlv(TAG_OCTET_STRING, &ap_req.iv),
        der::encode_tlv(TAG_OCTET_STRING, &ap_req.ciphertext),
    ])
}

fn decode_authenticator(buf: &[u8]) -> Result<Authenticator, der::DerError> {
    let outer = der::expect_tag(buf, TAG_SEQUENCE)?;
    let cname_tlv = der::expect_tag(outer.value, TAG_OCTET_STRING)?;
    let ctime_tlv = der::expect_tag(cname_tlv.rest, TAG_INTEGER)?;
    let binding_tlv = der::expect_tag(ctime_tlv.rest, TAG_OCTET_STRING)?;
    let pac_tlv = der::expect_tag(binding_tlv.rest, TAG_OCTET_STRING)?;

    Ok(Authenticator {
        cname: String::from_utf8_lossy(cname_tlv.value).into_owned(),
        ctime_usec: der::decode_u64(ctime_tlv.value) as i64,
        channel_binding: if binding_tlv.value.is_empty() {
            None
        } else {
            Some(binding_tlv.value.to_vec())
        },
        pac: if pac_tlv.value.is_empty() {
            None
        } else {
            Some(pac_tlv.value.to_vec())
        },
    })
}

fn encode_authenticator(auth: &Authenticator) -> Vec<u8> {
    der::encode_sequence(&[
        der::encode_tlv(TAG_OCTET_STRING, auth.cname.as_bytes()),
        der::encode_u64(TAG_INTEGER, auth.ctime_usec as u64),
        der::encode_tlv(TAG_OCTET_STRING, auth.channel_binding.as_deref().unwrap_or(&[])),
        der::encode_tlv(TAG_OCTET_STRING, auth.pac.as_deref().unwrap_or(&[])),
    ])
}

fn decrypt_authenticator(ap_req: &ApReq, entry: &KeytabEntry) -> Result<Vec<u8>, CoreError> {
    if ap_req.iv.len() != 16 {
        return Err(CoreError::KerberosFailed("IV must be 16 bytes".into()));
    }
    let iv: [u8; 16] = ap_req.iv.clone().try_into().expect("length checked above");

    match ap_req.enctype {
        EncType::AES256_CTS_HMAC_SHA1_96 => Aes256CbcDec::new_from_slices(&entry.key, &iv)
            .map_err(|e| CoreError::KerberosFailed(format!("bad AES-256 key/iv: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ap_req.ciphertext)
            .map_err(|e| CoreError::KerberosFailed(format!("AES-256 decrypt failed: {e}"))),
        EncType::AES128_CTS_HMAC_SHA1_96 => Aes128CbcDec::new_from_slices(&entry.key, &iv)
            .map_err(|e| CoreError::KerberosFailed(format!("bad AES-128 key/iv: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ap_req.ciphertext)
            .map_err(|e| CoreError::KerberosFailed(format!("AES-128 decrypt failed: {e}"))),
        other => Err(CoreError::KerberosFailed(format!("unsupported enctype {}", other.0))),
    }
}

fn encrypt_authenticator(enctype: EncType, key: &[u8], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    match enctype {
        EncType::AES256_CTS_HMAC_SHA1_96 => Aes256CbcEnc::new_from_slices(key, iv)
            .expect("fixture key/iv are well-formed")
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        EncType::AES128_CTS_HMAC_SHA1_96 => Aes128CbcEnc::new_from_slices(key, iv)
            .expect("fixture key/iv are well-formed")
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        other => panic!("unsupported enctype {} in test fixture", other.0),
    }
}

/// Round-trip self-test used by the rotation controller once a new keytab
/// entry has been minted: encrypts and decrypts a fixed plaintext under
/// the entry's own key, confirming the cipher parameters are usable before
/// the keytab is ever handed a real AP-REQ to decrypt.
pub(crate) fn self_test_entry(entry: &KeytabEntry) -> CoreResult<()> {
    const PROBE: &[u8] = b"rotation-self-test-probe-bytes--";
    let iv = [0x11u8; 16];
    let ciphertext = match entry.enctype {
        EncType::AES256_CTS_HMAC_SHA1_96 | EncType::AES128_CTS_HMAC_SHA1_96 => {
            encrypt_authenticator(entry.enctype, &entry.key, &iv, PROBE)
        }
        other => return Err(CoreError::RotationValidate(format!("unsupported enctype {}", other.0))),
    };
    let probe_req = ApReq {
        sname: entry.principal.clone(),
        crealm: entry.realm.clone(),
        kvno: entry.kvno,
        enctype: entry.enctype,
        iv: iv.to_vec(),
        ciphertext,
    };
    let decrypted = decrypt_authenticator(&probe_req, entry).map_err(|e| CoreError::RotationValidate(e.to_string()))?;
    if decrypted != PROBE {
        return Err(CoreError::RotationValidate("self-test round-trip mismatch".into()));
    }
    Ok(())
}
