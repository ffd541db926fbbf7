//! Canonical-JSON data model for the signing mirror server.
//!
//! Five role bodies (`root`, `index`, `snapshot`, `timestamp`, `component`) share one
//! envelope, `Manifest<T>`, and one encoding: canonical JSON, the deterministic
//! serialization (sorted keys, no insignificant whitespace) used both as the signing
//! payload and as the on-disk format.

pub mod error;
mod manifest;
mod role;

pub use error::Error;
pub use manifest::{
    renew_expires, ComponentItem, ComponentSigned, FileHash, FileVersion, IndexSigned, KeyInfo,
    Manifest, OwnerInfo, RootSigned, Signature, SnapshotSigned, TimestampSigned, VersionItem,
};
pub use role::RoleType;

use serde::Serialize;
use snafu::ResultExt;

/// Canonical JSON encoding of `value`: the exact byte sequence that gets signed and that
/// is written to disk. Sorted keys, no whitespace, fixed number formatting.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    let mut ser =
        serde_json::Serializer::with_formatter(&mut buf, olpc_cjson::CanonicalFormatter::new());
    value.serialize(&mut ser).context(error::EncodeSnafu)?;
    Ok(buf)
}

/// Decodes a manifest (or any canonical-JSON value) from bytes.
pub fn from_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).context(error::DecodeSnafu)
}

/// SHA-256 of `bytes`, lower-case hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
    data_hex(digest.as_ref())
}

fn data_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).expect("writing to a String never fails");
    }
    s
}
