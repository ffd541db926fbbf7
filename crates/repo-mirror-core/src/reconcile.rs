//! The reconciliation driver (`mergeUpstream`): the apex of the core. Invoked whenever a
//! request for `timestamp.json` arrives; single-flighted under the tag `"merge"` so
//! concurrent requests share one run.
//!
//! Ordering is load-bearing: snapshot-merge-prep, then root-rotation-check, then
//! index-merge, then component-merges, then snapshot-finalize, then timestamp-finalize,
//! then commit, then mtime-cache-update, in that exact sequence — `localSnap.meta` is the
//! authoritative pointer throughout, the snapshot must be written before timestamp hashes
//! it, and a file's length is only known once its bytes are staged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use repo_mirror_schema::{from_json, FileVersion, IndexSigned, KeyInfo, Manifest, SnapshotSigned};
use uuid::Uuid;

use crate::error::{self, Error, Result};
use crate::fstxn::FsTxn;
use crate::merge::{merge_component, merge_index, merge_snapshot};
use crate::model::{Keys, Model};
use crate::session::SessionManager;
use crate::singleflight::SingleFlight;
use crate::upstream::UpstreamCache;

pub struct Reconciler {
    root: PathBuf,
    sessions: Arc<SessionManager>,
    upstream: UpstreamCache,
    index_key: KeyInfo,
    snapshot_key: KeyInfo,
    timestamp_key: KeyInfo,
    owner_key: KeyInfo,
    single_flight: SingleFlight<()>,
}

impl Reconciler {
    pub fn new(
        root: PathBuf,
        upstream: UpstreamCache,
        index_key: KeyInfo,
        snapshot_key: KeyInfo,
        timestamp_key: KeyInfo,
        owner_key: KeyInfo,
    ) -> Self {
        Reconciler {
            root,
            sessions: Arc::new(SessionManager::new()),
            upstream,
            index_key,
            snapshot_key,
            timestamp_key,
            owner_key,
            single_flight: SingleFlight::new(),
        }
    }

    fn keys(&self) -> Keys<'_> {
        Keys {
            index: &self.index_key,
            snapshot: &self.snapshot_key,
            timestamp: &self.timestamp_key,
            owner: &self.owner_key,
        }
    }

    /// Runs one merge-and-resign cycle, or shares the result of one already in flight.
    pub fn merge_upstream(&self) -> Result<()> {
        self.single_flight
            .run("merge", || self.merge_upstream_once())
            .map_err(|arc_err| {
                error::UpstreamSnafu {
                    message: arc_err.to_string(),
                }
                .build()
            })
    }

    fn merge_upstream_once(&self) -> Result<()> {
        let updated = self.upstream.update_upstream()?;
        if updated.is_empty() {
            return Ok(());
        }

        let id = Uuid::new_v4().to_string();
        self.sessions.begin(&id)?;
        let mut txn = self.sessions.load(&id, self.root.clone())?;

        self.run_merge(&mut txn, &updated)?;

        txn.commit()?;
        self.upstream.update_cache_mtime()?;
        Ok(())
    }

    fn run_merge(&self, txn: &mut FsTxn, updated: &HashMap<String, Vec<u8>>) -> Result<()> {
        let now = Utc::now();
        let keys = self.keys();
        let model = Model::new(&keys);

        // Step 4: snapshot-merge-prep. A missing local snapshot.json means an empty
        // root-dir (cold start): seed local state from upstream instead of merging into
        // nothing.
        let remote_snap_bytes = updated
            .get("snapshot.json")
            .ok_or_else(|| Error::NotFound {
                name: "snapshot.json in upstream update".to_string(),
            })?;
        let remote_snap: Manifest<SnapshotSigned> = from_json(remote_snap_bytes).map_err(|source| {
            Error::Codec { source }
        })?;
        let mut local_snap_signed = match txn.read_manifest::<Manifest<SnapshotSigned>>("snapshot.json") {
            Ok(local) => {
                let mut local_signed = local.signed;
                merge_snapshot(&remote_snap.signed, &mut local_signed);
                local_signed
            }
            Err(Error::NotFound { .. }) => remote_snap.signed.clone(),
            Err(e) => return Err(e),
        };

        // Step 5: root-rotation-check. Root is never resigned here; on cold start we
        // still need root.json's bytes on disk to satisfy the versioned-root invariant.
        if txn.read("root.json").is_err() {
            if let Some(root_bytes) = updated.get("root.json") {
                let remote_root: Manifest<repo_mirror_schema::RootSigned> =
                    from_json(root_bytes).map_err(|source| Error::Codec { source })?;
                txn.write("root.json", root_bytes.clone());
                txn.write(
                    &format!("{}.root.json", remote_root.signed.version),
                    root_bytes.clone(),
                );
            }
            if let Some(root_meta) = remote_snap.signed.meta.get("/root.json") {
                local_snap_signed
                    .meta
                    .insert("/root.json".to_string(), root_meta.clone());
            }
        }

        // Step 6: index-merge.
        if let Some(remote_index_bytes) = updated.get("index.json") {
            self.merge_index_step(txn, &mut local_snap_signed, remote_index_bytes, now)?;
        }

        // Step 7: component-merges.
        self.merge_components_step(txn, &mut local_snap_signed, updated, now)?;

        // Step 8: snapshot-finalize.
        let local_snap_signed_for_finalize = local_snap_signed;
        model.update_snapshot_manifest(txn, now, move |_| local_snap_signed_for_finalize)?;

        // Step 9: timestamp-finalize.
        model.update_timestamp_manifest(txn, now)?;

        Ok(())
    }

    fn merge_index_step(
        &self,
        txn: &mut FsTxn,
        local_snap: &mut SnapshotSigned,
        remote_index_bytes: &[u8],
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let remote_index: Manifest<IndexSigned> =
            from_json(remote_index_bytes).map_err(|source| Error::Codec { source })?;

        let current_version = local_snap.meta.get("/index.json").map(|fv| fv.version);

        let merged = match current_version {
            Some(v) => match txn.read_local_manifest::<Manifest<IndexSigned>>(&format!("{}.index.json", v)) {
                Ok(local_index) => merge_index(
                    &local_index.signed,
                    remote_index.signed.clone(),
                    &self.index_key,
                    now,
                )?,
                Err(Error::NotFound { .. }) => merge_index(
                    &remote_index.signed.clone(),
                    remote_index.signed.clone(),
                    &self.index_key,
                    now,
                )?,
                Err(e) => return Err(e),
            },
            None => merge_index(
                &remote_index.signed.clone(),
                remote_index.signed.clone(),
                &self.index_key,
                now,
            )?,
        };

        let next_version = merged.signed.version;
        let name = format!("{}.index.json", next_version);
        txn.write_manifest(&name, &merged)?;
        let length = txn.stat(&name)?;
        local_snap.meta.insert(
            "/index.json".to_string(),
            FileVersion {
                version: next_version,
                length,
            },
        );
        Ok(())
    }

    fn merge_components_step(
        &self,
        txn: &mut FsTxn,
        local_snap: &mut SnapshotSigned,
        updated: &HashMap<String, Vec<u8>>,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let mut names: Vec<&String> = updated
            .keys()
            .filter(|name| {
                name.as_str() != "timestamp.json"
                    && name.as_str() != "snapshot.json"
                    && name.as_str() != "index.json"
                    && !name.ends_with("root.json")
            })
            .collect();
        names.sort();

        for file_name in names {
            let content = &updated[file_name];
            let remote_comp: Manifest<repo_mirror_schema::ComponentSigned> =
                from_json(content).map_err(|source| Error::Codec { source })?;

            let path = format!("/{}", file_name);
            let current_version = local_snap.meta.get(&path).map(|fv| fv.version);

            let merged = match current_version {
                Some(v) => match txn
                    .read_local_manifest::<Manifest<repo_mirror_schema::ComponentSigned>>(&format!(
                        "{}.{}",
                        v, file_name
                    )) {
                    Ok(local_comp) => merge_component(
                        &local_comp.signed,
                        remote_comp.signed.clone(),
                        &self.owner_key,
                        now,
                    )?,
                    Err(Error::NotFound { .. }) => merge_component(
                        &remote_comp.signed.clone(),
                        remote_comp.signed.clone(),
                        &self.owner_key,
                        now,
                    )?,
                    Err(e) => return Err(e),
                },
                None => merge_component(
                    &remote_comp.signed.clone(),
                    remote_comp.signed.clone(),
                    &self.owner_key,
                    now,
                )?,
            };

            let next_version = merged.signed.version;
            let name = format!("{}.{}", next_version, file_name);
            txn.write_manifest(&name, &merged)?;
            let length = txn.stat(&name)?;
            local_snap.meta.insert(
                path,
                FileVersion {
                    version: next_version,
                    length,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamClient;
    use repo_mirror_schema::{
        to_canonical_json, ComponentItem, ComponentSigned, IndexSigned, KeyInfo, OwnerInfo,
        RootSigned, VersionItem,
    };
    use std::collections::BTreeMap;
    use std::fs;
    use std::num::NonZeroU64;

    struct NoopClient;
    impl UpstreamClient for NoopClient {
        fn refresh(&self) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    fn write(dir: &std::path::Path, name: &str, bytes: &[u8]) {
        fs::write(dir.join(name), bytes).unwrap();
    }

    fn seed_upstream(manifests: &std::path::Path, key: &KeyInfo) {
        let root = RootSigned {
            version: NonZeroU64::new(1).unwrap(),
            expires: Utc::now(),
            roles: BTreeMap::new(),
        };
        write(
            manifests,
            "root.json",
            &to_canonical_json(&Manifest::new(root)).unwrap(),
        );

        let mut snap = SnapshotSigned {
            version: NonZeroU64::new(1).unwrap(),
            expires: Utc::now(),
            meta: BTreeMap::new(),
        };
        snap.meta.insert(
            "/index.json".to_string(),
            FileVersion {
                version: NonZeroU64::new(1).unwrap(),
                length: 0,
            },
        );
        snap.meta.insert(
            "/foo.json".to_string(),
            FileVersion {
                version: NonZeroU64::new(1).unwrap(),
                length: 0,
            },
        );
        snap.meta.insert(
            "/root.json".to_string(),
            FileVersion {
                version: NonZeroU64::new(1).unwrap(),
                length: 0,
            },
        );
        write(
            manifests,
            "snapshot.json",
            &to_canonical_json(&Manifest::new(snap)).unwrap(),
        );

        let timestamp = repo_mirror_schema::TimestampSigned {
            version: NonZeroU64::new(1).unwrap(),
            expires: Utc::now(),
            meta: BTreeMap::new(),
        };
        write(
            manifests,
            "timestamp.json",
            &to_canonical_json(&Manifest::new(timestamp)).unwrap(),
        );

        let mut components = BTreeMap::new();
        components.insert("foo".to_string(), ComponentItem { description: None });
        let index = IndexSigned {
            version: NonZeroU64::new(1).unwrap(),
            expires: Utc::now(),
            components,
            owners: BTreeMap::<String, OwnerInfo>::new(),
        };
        let index_manifest = Manifest {
            signed: index,
            signatures: repo_mirror_signer::sign(
                &IndexSigned {
                    version: NonZeroU64::new(1).unwrap(),
                    expires: Utc::now(),
                    components: BTreeMap::new(),
                    owners: BTreeMap::new(),
                },
                &[key],
            )
            .unwrap(),
        };
        write(
            manifests,
            "index.json",
            &to_canonical_json(&index_manifest).unwrap(),
        );

        let mut platforms = BTreeMap::new();
        let mut versions = BTreeMap::new();
        versions.insert(
            "v1.0.0".to_string(),
            VersionItem {
                url: "http://upstream/foo-v1.tar".to_string(),
                sha256: None,
                size: None,
            },
        );
        platforms.insert("linux/amd64".to_string(), versions);
        let component = ComponentSigned {
            version: NonZeroU64::new(1).unwrap(),
            expires: Utc::now(),
            filename: "foo.json".to_string(),
            platforms,
        };
        write(
            manifests,
            "foo.json",
            &to_canonical_json(&Manifest::new(component)).unwrap(),
        );
    }

    fn keys() -> (KeyInfo, KeyInfo, KeyInfo, KeyInfo) {
        (
            repo_mirror_signer::generate_ed25519_for_test(),
            repo_mirror_signer::generate_ed25519_for_test(),
            repo_mirror_signer::generate_ed25519_for_test(),
            repo_mirror_signer::generate_ed25519_for_test(),
        )
    }

    #[test]
    fn cold_start_seeds_every_role_from_upstream() {
        let root_dir = tempfile::tempdir().unwrap();
        let manifests_dir = root_dir.path().join("manifests");
        fs::create_dir_all(&manifests_dir).unwrap();
        let (index_key, snapshot_key, timestamp_key, owner_key) = keys();
        seed_upstream(&manifests_dir, &index_key);

        let cache = UpstreamCache::new(manifests_dir, Arc::new(NoopClient)).unwrap();
        let reconciler = Reconciler::new(
            root_dir.path().to_path_buf(),
            cache,
            index_key,
            snapshot_key,
            timestamp_key,
            owner_key,
        );

        reconciler.merge_upstream().unwrap();

        assert!(root_dir.path().join("root.json").exists());
        assert!(root_dir.path().join("2.index.json").exists());
        assert!(root_dir.path().join("2.foo.json").exists());

        let snap: Manifest<SnapshotSigned> =
            from_json(&fs::read(root_dir.path().join("snapshot.json")).unwrap()).unwrap();
        assert_eq!(snap.signed.meta["/foo.json"].version.get(), 2);
        assert_eq!(snap.signed.meta["/index.json"].version.get(), 2);

        let foo: Manifest<ComponentSigned> =
            from_json(&fs::read(root_dir.path().join("2.foo.json")).unwrap()).unwrap();
        assert_eq!(foo.signed.version.get(), 2);
    }

    #[test]
    fn idempotent_second_merge_is_a_no_op() {
        let root_dir = tempfile::tempdir().unwrap();
        let manifests_dir = root_dir.path().join("manifests");
        fs::create_dir_all(&manifests_dir).unwrap();
        let (index_key, snapshot_key, timestamp_key, owner_key) = keys();
        seed_upstream(&manifests_dir, &index_key);

        let cache = UpstreamCache::new(manifests_dir, Arc::new(NoopClient)).unwrap();
        let reconciler = Reconciler::new(
            root_dir.path().to_path_buf(),
            cache,
            index_key,
            snapshot_key,
            timestamp_key,
            owner_key,
        );

        reconciler.merge_upstream().unwrap();
        reconciler.merge_upstream().unwrap();

        assert!(!root_dir.path().join("3.index.json").exists());
        assert!(!root_dir.path().join("3.foo.json").exists());
    }

    #[test]
    fn failing_upstream_refresh_leaves_tree_untouched() {
        struct FailingClient;
        impl UpstreamClient for FailingClient {
            fn refresh(&self) -> std::result::Result<(), String> {
                Err("connection reset".to_string())
            }
        }

        let root_dir = tempfile::tempdir().unwrap();
        let manifests_dir = root_dir.path().join("manifests");
        fs::create_dir_all(&manifests_dir).unwrap();
        fs::write(manifests_dir.join("snapshot.json"), b"stale").unwrap();
        let (index_key, snapshot_key, timestamp_key, owner_key) = keys();

        let cache = UpstreamCache::new(manifests_dir, Arc::new(FailingClient)).unwrap();
        let reconciler = Reconciler::new(
            root_dir.path().to_path_buf(),
            cache,
            index_key,
            snapshot_key,
            timestamp_key,
            owner_key,
        );

        let err = reconciler.merge_upstream().unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
        assert!(!root_dir.path().join("snapshot.json").exists());
    }
}
