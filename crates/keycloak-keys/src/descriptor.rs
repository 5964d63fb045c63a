//! Published key descriptor.
//!
//! The descriptor groups key entries by usage:
//!
//! ```json
//! {
//!   "signing": [
//!     {
//!       "keyName": "sig-key-1",
//!       "certificate": {
//!         "subject": "CN=idp",
//!         "serialNumber": "42",
//!         "notBefore": "2024-01-01T00:00:00Z",
//!         "notAfter": "2034-01-01T00:00:00Z",
//!         "publicKey": { "algorithm": "RSA", "encoded": "MIIBIjAN..." }
//!       }
//!     }
//!   ],
//!   "encryption": []
//! }
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::debug;

/// Usage block consumed by the key locator.
pub const SIGNING_USAGE: &str = "signing";
pub const ENCRYPTION_USAGE: &str = "encryption";

/// Key entries grouped by usage.
///
/// Entries that fail to parse are logged and dropped one by one; the rest of
/// their block is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct KeyDescriptor {
    usages: HashMap<String, Vec<KeyInfo>>,
}

impl<'de> Deserialize<'de> for KeyDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = HashMap::<String, Value>::deserialize(deserializer)?;
        let usages = raw
            .into_iter()
            .map(|(usage, block)| {
                let entries = parse_block(&usage, block);
                (usage, entries)
            })
            .collect();
        Ok(Self { usages })
    }
}

fn parse_block(usage: &str, block: Value) -> Vec<KeyInfo> {
    let Value::Array(entries) = block else {
        debug!(usage, "Skipping usage block that is not a list");
        return Vec::new();
    };
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value::<KeyInfo>(entry) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(usage, index, error = %e, "Skipping unparseable key entry");
                None
            }
        })
        .collect()
}

impl KeyDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `entry` under `usage`.
    pub fn with_key(mut self, usage: &str, entry: KeyInfo) -> Self {
        self.usages.entry(usage.to_string()).or_default().push(entry);
        self
    }

    pub fn with_signing_key(self, entry: KeyInfo) -> Self {
        self.with_key(SIGNING_USAGE, entry)
    }

    /// Entries published for `usage`. `None` when the block is absent.
    pub fn keys_for(&self, usage: &str) -> Option<&[KeyInfo]> {
        self.usages.get(usage).map(Vec::as_slice)
    }

    pub fn signing_keys(&self) -> Option<&[KeyInfo]> {
        self.keys_for(SIGNING_USAGE)
    }
}

/// One key entry. Entries without a certificate are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateInfo>,
}

impl KeyInfo {
    pub fn named(name: impl Into<String>, certificate: CertificateInfo) -> Self {
        Self {
            key_name: Some(name.into()),
            certificate: Some(certificate),
        }
    }

    pub fn anonymous(certificate: CertificateInfo) -> Self {
        Self {
            key_name: None,
            certificate: Some(certificate),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub serial_number: String,
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    pub public_key: PublicKey,
}

impl CertificateInfo {
    /// Whether `now` lies inside `[not_before, not_after]`.
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Name used for certificates published without a key name.
    ///
    /// The random suffix keeps names unique across certificates that share
    /// subject and serial.
    pub fn synthetic_name(&self) -> String {
        format!(
            "{}@{}${}",
            self.subject.as_deref().unwrap_or("unnamed"),
            self.serial_number,
            uuid::Uuid::new_v4()
        )
    }
}

/// Encoded public key material.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub algorithm: String,
    #[serde(with = "base64_bytes")]
    pub encoded: Vec<u8>,
}

impl PublicKey {
    pub fn new(algorithm: impl Into<String>, encoded: impl Into<Vec<u8>>) -> Self {
        Self {
            algorithm: algorithm.into(),
            encoded: encoded.into(),
        }
    }

    pub fn hash(&self) -> KeyHash {
        KeyHash::of(self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .field("hash", &self.hash())
            .finish()
    }
}

/// SHA-256 of the encoded key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHash([u8; 32]);

impl KeyHash {
    pub fn of(key: &PublicKey) -> Self {
        Self(Sha256::digest(&key.encoded).into())
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({self})")
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let compact: String = raw.split_whitespace().collect();
        STANDARD.decode(compact).map_err(serde::de::Error::custom)
    }
}
