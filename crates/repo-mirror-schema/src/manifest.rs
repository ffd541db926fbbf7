use std::collections::BTreeMap;
use std::num::NonZeroU64;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::role::RoleType;
use crate::{to_canonical_json, Error};

/// A signing or verification key. `value` holds `"public"` and, for keys this server
/// holds privately, `"private"` — both base64 or hex text, opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub scheme: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub value: BTreeMap<String, String>,
}

impl KeyInfo {
    /// Stable identifier: the hex SHA-256 digest of the canonical-JSON encoding of the
    /// public portion only, so a key's ID is the same whether or not the private half is
    /// present.
    pub fn key_id(&self) -> Result<String, Error> {
        let public = self
            .value
            .get("public")
            .ok_or(Error::MissingPublicValue)?;
        let mut only_public = BTreeMap::new();
        only_public.insert("public".to_string(), public.clone());
        let payload = to_canonical_json(&only_public)?;
        Ok(crate::sha256_hex(&payload))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    pub sig: String,
}

/// The shared envelope for every role: signed content plus its detached signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest<T> {
    pub signed: T,
    pub signatures: Vec<Signature>,
}

impl<T> Manifest<T> {
    pub fn new(signed: T) -> Self {
        Manifest {
            signed,
            signatures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootSigned {
    pub version: NonZeroU64,
    pub expires: DateTime<Utc>,
    pub roles: BTreeMap<RoleType, Vec<KeyInfo>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerInfo {
    pub keys: BTreeMap<String, KeyInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSigned {
    pub version: NonZeroU64,
    pub expires: DateTime<Utc>,
    pub components: BTreeMap<String, ComponentItem>,
    pub owners: BTreeMap<String, OwnerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub version: NonZeroU64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSigned {
    pub version: NonZeroU64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, FileVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHash {
    pub hashes: BTreeMap<String, String>,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampSigned {
    pub version: NonZeroU64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, FileHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionItem {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSigned {
    pub version: NonZeroU64,
    pub expires: DateTime<Utc>,
    pub filename: String,
    pub platforms: BTreeMap<String, BTreeMap<String, VersionItem>>,
}

/// Sets `expires` to `now` plus this role's fixed validity window.
pub fn renew_expires(role: RoleType, now: DateTime<Utc>) -> DateTime<Utc> {
    let window = match role {
        RoleType::Timestamp => chrono::Duration::hours(1),
        RoleType::Snapshot => chrono::Duration::days(1),
        RoleType::Index => chrono::Duration::days(7),
        RoleType::Owner => chrono::Duration::days(365),
        RoleType::Root => chrono::Duration::days(365),
    };
    now + window
}
