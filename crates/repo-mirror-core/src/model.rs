//! Role-aware manifest reader/writer layered on an [`FsTxn`]: enforces
//! version-monotonicity, renews `expires`, signs with the role key, and writes both the
//! canonical filename and the versioned dual-file where the role has one.

use std::num::NonZeroU64;

use chrono::{DateTime, Utc};
use repo_mirror_schema::{
    renew_expires, ComponentSigned, IndexSigned, KeyInfo, Manifest, RoleType, RootSigned,
    SnapshotSigned, TimestampSigned,
};
use snafu::{ensure, ResultExt};

use crate::error::{self, Error, Result};
use crate::fstxn::FsTxn;

/// The four signing keys this server holds privately at startup. `root` is deliberately
/// absent: this server never signs root.
pub struct Keys<'a> {
    pub index: &'a KeyInfo,
    pub snapshot: &'a KeyInfo,
    pub timestamp: &'a KeyInfo,
    pub owner: &'a KeyInfo,
}

pub struct Model<'a> {
    keys: &'a Keys<'a>,
}

impl<'a> Model<'a> {
    pub fn new(keys: &'a Keys<'a>) -> Self {
        Model { keys }
    }

    pub fn read_root_manifest(&self, txn: &FsTxn) -> Result<Manifest<RootSigned>> {
        txn.read_manifest("root.json")
    }

    pub fn read_snapshot_manifest(&self, txn: &FsTxn) -> Result<Manifest<SnapshotSigned>> {
        txn.read_manifest("snapshot.json")
    }

    pub fn read_index_manifest(&self, txn: &FsTxn) -> Result<Manifest<IndexSigned>> {
        let snap = self.read_snapshot_manifest(txn)?;
        let version = snap
            .signed
            .meta
            .get("/index.json")
            .ok_or_else(|| Error::NotFound {
                name: "/index.json in snapshot.meta".to_string(),
            })?
            .version;
        txn.read_manifest(&format!("{}.index.json", version))
    }

    pub fn read_component_manifest(
        &self,
        txn: &FsTxn,
        component: &str,
    ) -> Result<Manifest<ComponentSigned>> {
        let snap = self.read_snapshot_manifest(txn)?;
        let path = format!("/{}.json", component);
        let version = snap
            .signed
            .meta
            .get(&path)
            .ok_or_else(|| Error::NotFound { name: path.clone() })?
            .version;
        txn.read_manifest(&format!("{}.{}.json", version, component))
    }

    /// Requires `manifest.signed.version == prev.version + 1`; writes `root.json` and
    /// `<version>.root.json`.
    pub fn update_root_manifest(
        &self,
        txn: &mut FsTxn,
        manifest: Manifest<RootSigned>,
    ) -> Result<()> {
        let prev = self.read_root_manifest(txn)?;
        let expected = prev.signed.version.get() + 1;
        ensure!(
            manifest.signed.version.get() == expected,
            error::ConflictSnafu {
                name: "root.json".to_string(),
                expected,
                got: manifest.signed.version.get(),
            }
        );
        txn.write_manifest("root.json", &manifest)?;
        txn.write_manifest(&format!("{}.root.json", manifest.signed.version), &manifest)
    }

    /// Reads the current index (discovered through `snapshot.meta`), applies `f`, bumps
    /// the version, renews, resigns, and writes the new versioned file. Does not touch
    /// `snapshot.meta` — that is the reconciliation driver's responsibility, so the whole
    /// merge commits atomically.
    pub fn update_index_manifest(
        &self,
        txn: &mut FsTxn,
        now: DateTime<Utc>,
        f: impl FnOnce(IndexSigned) -> IndexSigned,
    ) -> Result<Manifest<IndexSigned>> {
        let last = self.read_index_manifest(txn)?;
        let next_version = NonZeroU64::new(last.signed.version.get() + 1).expect("non-zero");
        let mut signed = f(last.signed);
        signed.version = next_version;
        signed.expires = renew_expires(RoleType::Index, now);
        let signatures =
            repo_mirror_signer::sign(&signed, &[self.keys.index]).context(error::SigningSnafu)?;
        let manifest = Manifest { signed, signatures };
        txn.write_manifest(&format!("{}.index.json", next_version), &manifest)?;
        Ok(manifest)
    }

    /// Reads the current `snapshot.json` (if any), applies `f`, bumps the version,
    /// renews, resigns, and overwrites `snapshot.json`. No versioned dual-file.
    pub fn update_snapshot_manifest(
        &self,
        txn: &mut FsTxn,
        now: DateTime<Utc>,
        f: impl FnOnce(SnapshotSigned) -> SnapshotSigned,
    ) -> Result<Manifest<SnapshotSigned>> {
        let (prev_signed, next_version) = match self.read_snapshot_manifest(txn) {
            Ok(prev) => {
                let next = NonZeroU64::new(prev.signed.version.get() + 1).expect("non-zero");
                (prev.signed, next)
            }
            Err(Error::NotFound { .. }) => (
                SnapshotSigned {
                    version: NonZeroU64::new(1).expect("non-zero"),
                    expires: now,
                    meta: Default::default(),
                },
                NonZeroU64::new(1).expect("non-zero"),
            ),
            Err(e) => return Err(e),
        };
        let mut signed = f(prev_signed);
        signed.version = next_version;
        signed.expires = renew_expires(RoleType::Snapshot, now);
        let signatures = repo_mirror_signer::sign(&signed, &[self.keys.snapshot])
            .context(error::SigningSnafu)?;
        let manifest = Manifest { signed, signatures };
        txn.write_manifest("snapshot.json", &manifest)?;
        Ok(manifest)
    }

    /// Reads `snapshot.json`'s bytes, hashes them, bumps `timestamp.json`'s version,
    /// records the snapshot's hash/length, renews, and resigns.
    pub fn update_timestamp_manifest(
        &self,
        txn: &mut FsTxn,
        now: DateTime<Utc>,
    ) -> Result<Manifest<TimestampSigned>> {
        let snapshot_bytes = txn.read("snapshot.json")?;
        let length = snapshot_bytes.len() as u64;
        let sha256 = repo_mirror_schema::sha256_hex(&snapshot_bytes);

        let (mut signed, next_version) = match txn.read_manifest::<Manifest<TimestampSigned>>("timestamp.json")
        {
            Ok(existing) => {
                let next = NonZeroU64::new(existing.signed.version.get() + 1).expect("non-zero");
                (existing.signed, next)
            }
            Err(Error::NotFound { .. }) => (
                TimestampSigned {
                    version: NonZeroU64::new(1).expect("non-zero"),
                    expires: now,
                    meta: Default::default(),
                },
                NonZeroU64::new(1).expect("non-zero"),
            ),
            Err(e) => return Err(e),
        };
        signed.version = next_version;
        let mut hashes = std::collections::BTreeMap::new();
        hashes.insert("sha256".to_string(), sha256);
        signed.meta.insert(
            "/snapshot.json".to_string(),
            repo_mirror_schema::FileHash { hashes, length },
        );
        signed.expires = renew_expires(RoleType::Timestamp, now);
        let signatures = repo_mirror_signer::sign(&signed, &[self.keys.timestamp])
            .context(error::SigningSnafu)?;
        let manifest = Manifest { signed, signatures };
        txn.write_manifest("timestamp.json", &manifest)?;
        Ok(manifest)
    }
}
