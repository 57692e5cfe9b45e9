// [src/keytab.rs]
//! Keytab Loader (component C4).
//!
//! Parses the MIT keytab binary framing (file format version `0502`) into a
//! sequence of `(principal, kvno, enctype, key)` entries and exposes a
//! highest-kvno lookup by principal + enctype. No pack file encodes this
//! framing; it is taken directly from the well-known on-disk layout (see
//! `krb5.git: src/lib/krb5/keytab/ktfns.c` for the canonical reference,
//! not available in this pack) since `spec.md` only requires that the
//! parser recognize it, not that it originate from example code.

use std::convert::TryInto;

use thiserror::Error;

/// Kerberos encryption type identifiers relevant to this core (RFC 3961/8009).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncType(pub u16);

impl EncType {
    pub const AES256_CTS_HMAC_SHA1_96: EncType = EncType(18);
    pub const AES128_CTS_HMAC_SHA1_96: EncType = EncType(17);
    pub const RC4_HMAC: EncType = EncType(23);

    /// AES256-CTS-HMAC-SHA1-96 is the only enctype §3 requires every keytab
    /// to carry at least one entry of; others are accepted but not required.
    pub fn is_supported(&self) -> bool {
        matches!(
            *self,
            EncType::AES256_CTS_HMAC_SHA1_96 | EncType::AES128_CTS_HMAC_SHA1_96 | EncType::RC4_HMAC
        )
    }
}

#[derive(Debug, Clone)]
pub struct KeytabEntry {
    pub principal: String,
    pub realm: String,
    pub kvno: u32,
    pub enctype: EncType,
    pub key: Vec<u8>,
    pub timestamp: u32,
}

impl KeytabEntry {
    /// `SERVICE/host` form, joining all but the last name component with
    /// `/` — `sname` is treated as `service/host` throughout this crate.
    pub fn service_principal(&self) -> String {
        self.principal.clone()
    }
}

#[derive(Debug, Error)]
pub enum KeytabError {
    #[error("keytab buffer is shorter than the framing header")]
    Truncated,
    #[error("unsupported keytab file format version {0:#06x}")]
    UnsupportedVersion(u16),
    #[error("entry at offset {0} is malformed: {1}")]
    MalformedEntry(usize, &'static str),
    #[error("keytab contains no entries")]
    Empty,
}

pub struct Keytab {
    pub entries: Vec<KeytabEntry>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], KeytabError> {
        if self.remaining() < n {
            return Err(KeytabError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, KeytabError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, KeytabError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, KeytabError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn counted_str(&mut self) -> Result<String, KeytabError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl Keytab {
    /// Parses the decoded keytab buffer into its constituent entries.
    /// Never panics on malformed input — returns [`KeytabError`].
    pub fn parse(buf: &[u8]) -> Result<Keytab, KeytabError> {
        let mut cursor = Cursor::new(buf);
        if cursor.remaining() < 2 {
            return Err(KeytabError::Truncated);
        }
        let version = cursor.u16()?;
        if version != 0x0502 {
            return Err(KeytabError::UnsupportedVersion(version));
        }

        let mut entries = Vec::new();
        while cursor.remaining() >= 4 {
            let entry_start = cursor.pos;
            let entry_len = cursor.i32()?;
            if entry_len == 0 {
                continue;
            }
            if entry_len < 0 {
                // A hole left by a deleted entry; skip it.
                let skip = (-entry_len) as usize;
                cursor.take(skip)?;
                continue;
            }
            let entry_bytes = cursor.take(entry_len as usize)?;
            entries.push(parse_entry(entry_bytes, entry_start)?);
        }

        if entries.is_empty() {
            return Err(KeytabError::Empty);
        }
        Ok(Keytab { entries })
    }

    /// Highest-kvno entry whose service principal matches `spn` (exact
    /// string match; normalization is the caller's responsibility).
    pub fn find_entry_for_principal(&self, spn: &str) -> Option<&KeytabEntry> {
        self.entries
            .iter()
            .filter(|e| e.principal == spn)
            .max_by_key(|e| e.kvno)
    }

    /// Highest-kvno entry matching both principal and enctype, used by the
    /// SPNEGO validator to pick the decryption key for a specific ticket.
    pub fn find_entry(&self, spn: &str, enctype: EncType) -> Option<&KeytabEntry> {
        self.entries
            .iter()
            .filter(|e| e.principal == spn && e.enctype.0 == enctype.0)
            .max_by_key(|e| e.kvno)
    }
}

fn parse_entry(buf: &[u8], offset: usize) -> Result<KeytabEntry, KeytabError> {
    let mut cursor = Cursor::new(buf);
    let num_components = cursor.u16()?;
    let realm = cursor.counted_str()?;

    let mut components = Vec::with_capacity(num_components as usize);
    for _ in 0..num_components {
        components.push(cursor.counted_str()?);
    }
    if components.is_empty() {
        return Err(KeytabError::MalformedEntry(offset, "principal has no components"));
    }

    let _name_type = cursor.i32()?;
    let timestamp = cursor.u32()?;
    let kvno8 = cursor.take(1)?[0] as u32;
    let enctype = EncType(cursor.u16()?);
    let key_len = cursor.u16()? as usize;
    let key = cursor.take(key_len)?.to_vec();

    // Optional 32-bit kvno extension, present when remaining bytes allow it.
    let kvno = if cursor.remaining() >= 4 {
        cursor.u32().unwrap_or(kvno8 as u32)
    } else {
        kvno8
    };

    Ok(KeytabEntry {
        principal: components.join("/"),
        realm,
        kvno,
        enctype,
        key,
        timestamp,
    })
}

/// Serializes a single entry back into keytab binary framing — used by the
/// rotation controller's self-test helper and by tests to synthesize fixtures.
pub fn encode_single_entry_keytab(principal: &str, realm: &str, kvno: u32, enctype: EncType, key: &[u8]) -> Vec<u8> {
    let components: Vec<&str> = principal.split('/').collect();

    let mut entry = Vec::new();
    entry.extend_from_slice(&(components.len() as u16).to_be_bytes());
    push_counted_str(&mut entry, realm);
    for c in &components {
        push_counted_str(&mut entry, c);
    }
    entry.extend_from_slice(&1i32.to_be_bytes()); // name_type = NT-PRINCIPAL
    entry.extend_from_slice(&0u32.to_be_bytes()); // timestamp
    entry.push((kvno & 0xff) as u8);
    entry.extend_from_slice(&enctype.0.to_be_bytes());
    entry.extend_from_slice(&(key.len() as u16).to_be_bytes());
    entry.extend_from_slice(key);
    entry.extend_from_slice(&kvno.to_be_bytes());

    let mut out = Vec::new();
    out.extend_from_slice(&0x0502u16.to_be_bytes());
    out.extend_from_slice(&(entry.len() as i32).to_be_bytes());
    out.extend_from_slice(&entry);
    out
}

fn push_counted_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a minimal valid single-entry keytab for `spn`, used across
    /// this crate's test suites.
    pub(crate) fn sample_keytab_bytes(spn: &str) -> Vec<u8> {
        encode_single_entry_keytab(spn, "LOCAL.LAB", 1, EncType::AES256_CTS_HMAC_SHA1_96, &[7u8; 32])
    }

    #[test]
    fn parse_round_trips_encoded_entry() {
        let bytes = sample_keytab_bytes("HTTP/vault.local.lab");
        let kt = Keytab::parse(&bytes).unwrap();
        assert_eq!(kt.entries.len(), 1);
        let entry = &kt.entries[0];
        assert_eq!(entry.principal, "HTTP/vault.local.lab");
        assert_eq!(entry.realm, "LOCAL.LAB");
        assert_eq!(entry.kvno, 1);
        assert_eq!(entry.enctype, EncType::AES256_CTS_HMAC_SHA1_96);
        assert_eq!(entry.key, vec![7u8; 32]);
    }

    #[test]
    fn parse_rejects_bad_version() {
        let mut bytes = sample_keytab_bytes("HTTP/vault.local.lab");
        bytes[1] = 0x00;
        assert!(Keytab::parse(&bytes).is_err());
    }

    #[test]
    fn parse_rejects_truncated_buffer() {
        let bytes = sample_keytab_bytes("HTTP/vault.local.lab");
        assert!(Keytab::parse(&bytes[..bytes.len() - 10]).is_err());
    }

    #[test]
    fn find_entry_for_principal_picks_highest_kvno() {
        let mut out = Vec::new();
        out.extend_from_slice(&0x0502u16.to_be_bytes());
        for kvno in [1u32, 3, 2] {
            let entry_bytes = &encode_single_entry_keytab(
                "HTTP/vault.local.lab",
                "LOCAL.LAB",
                kvno,
                EncType::AES256_CTS_HMAC_SHA1_96,
                &[1u8; 32],
            )[6..];
            out.extend_from_slice(&(entry_bytes.len() as i32).to_be_bytes());
            out.extend_from_slice(entry_bytes);
        }
        let kt = Keytab::parse(&out).unwrap();
        let best = kt.find_entry_for_principal("HTTP/vault.local.lab").unwrap();
        assert_eq!(best.kvno, 3);
    }

    #[test]
    fn encoded_keytab_is_supported_enctype() {
        let bytes = sample_keytab_bytes("HTTP/vault.local.lab");
        let kt = Keytab::parse(&bytes).unwrap();
        assert!(kt.entries[0].enctype.is_supported());
    }
}
