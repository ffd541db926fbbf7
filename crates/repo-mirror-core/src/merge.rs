//! Pure merge functions: combine a local and a remote manifest of one role into a new
//! manifest, resign, and never overwrite local-only entries (except the `"qa"` prefix
//! override on component platform versions).

use std::num::NonZeroU64;

use chrono::{DateTime, Utc};
use repo_mirror_schema::{
    renew_expires, ComponentSigned, IndexSigned, KeyInfo, Manifest, RoleType, SnapshotSigned,
};
use snafu::ResultExt;

use crate::error::{self, Result};

const QA_PREFIX: &str = "qa";

/// `src`'s platform/version entries are grafted into `dst`, overwriting only where `dst`
/// lacks the entry or `dst`'s existing version string carries the `"qa"` prefix (upstream
/// may freely republish QA builds; stable versions are immutable once published locally).
/// `dst`'s version becomes `max(dst.version, src.version) + 1`, matching upstream's own
/// `MergeComponent`.
pub fn merge_component(
    src: &ComponentSigned,
    mut dst: ComponentSigned,
    owner_key: &KeyInfo,
    now: DateTime<Utc>,
) -> Result<Manifest<ComponentSigned>> {
    for (platform, versions) in &src.platforms {
        let dst_platform = dst.platforms.entry(platform.clone()).or_default();
        for (version_str, item) in versions {
            let overwrite = match dst_platform.get(version_str) {
                None => true,
                Some(_) => version_str.starts_with(QA_PREFIX),
            };
            if overwrite {
                dst_platform.insert(version_str.clone(), item.clone());
            }
        }
    }
    dst.version = NonZeroU64::new(std::cmp::max(dst.version.get(), src.version.get()) + 1)
        .expect("non-zero");
    dst.expires = renew_expires(RoleType::Owner, now);
    let signatures = repo_mirror_signer::sign(&dst, &[owner_key]).context(error::SigningSnafu)?;
    Ok(Manifest {
        signed: dst,
        signatures,
    })
}

/// Components and owner keys present in `src` but missing from `dst` are inserted into
/// `dst`; existing `dst` entries are never overwritten. `dst`'s version becomes
/// `max(dst.version, src.version) + 1`, matching upstream's own `MergeIndex`.
pub fn merge_index(
    src: &IndexSigned,
    mut dst: IndexSigned,
    index_key: &KeyInfo,
    now: DateTime<Utc>,
) -> Result<Manifest<IndexSigned>> {
    for (name, component) in &src.components {
        dst.components
            .entry(name.clone())
            .or_insert_with(|| component.clone());
    }
    for (owner_id, owner) in &src.owners {
        let dst_owner = dst.owners.entry(owner_id.clone()).or_default();
        for (key_id, key) in &owner.keys {
            dst_owner
                .keys
                .entry(key_id.clone())
                .or_insert_with(|| key.clone());
        }
    }
    dst.version = NonZeroU64::new(std::cmp::max(dst.version.get(), src.version.get()) + 1)
        .expect("non-zero");
    dst.expires = renew_expires(RoleType::Index, now);
    let signatures = repo_mirror_signer::sign(&dst, &[index_key]).context(error::SigningSnafu)?;
    Ok(Manifest {
        signed: dst,
        signatures,
    })
}

/// `src`'s `meta` entries are inserted into `dst` wherever `dst` lacks the path. Never
/// overwrites, never signs — snapshot's version bump and signature happen once, in the
/// reconciliation driver's finalize step, after every role has been merged.
pub fn merge_snapshot(src: &SnapshotSigned, dst: &mut SnapshotSigned) {
    for (path, file_version) in &src.meta {
        dst.meta.entry(path.clone()).or_insert_with(|| file_version.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_mirror_schema::VersionItem;
    use std::collections::BTreeMap;

    fn item(url: &str) -> VersionItem {
        VersionItem {
            url: url.to_string(),
            sha256: None,
            size: None,
        }
    }

    fn component(platforms: BTreeMap<String, BTreeMap<String, VersionItem>>) -> ComponentSigned {
        ComponentSigned {
            version: NonZeroU64::new(1).unwrap(),
            expires: Utc::now(),
            filename: "foo.json".to_string(),
            platforms,
        }
    }

    #[test]
    fn stable_version_conflict_dst_keeps_its_own_value() {
        let key = repo_mirror_signer::generate_ed25519_for_test();
        let mut local_platforms = BTreeMap::new();
        let mut versions = BTreeMap::new();
        versions.insert("v1.0.0".to_string(), item("URL_A"));
        local_platforms.insert("linux/amd64".to_string(), versions);
        let local = component(local_platforms);

        let mut remote_platforms = BTreeMap::new();
        let mut versions = BTreeMap::new();
        versions.insert("v1.0.0".to_string(), item("URL_B"));
        remote_platforms.insert("linux/amd64".to_string(), versions);
        let remote = component(remote_platforms);

        let merged = merge_component(&local, remote, &key, Utc::now()).unwrap();

        let url = &merged.signed.platforms["linux/amd64"]["v1.0.0"].url;
        assert_eq!(url, "URL_B");
        assert_eq!(merged.signed.version.get(), 2);
    }

    #[test]
    fn qa_prefix_lets_src_override_dst() {
        let key = repo_mirror_signer::generate_ed25519_for_test();
        let mut local_platforms = BTreeMap::new();
        let mut versions = BTreeMap::new();
        versions.insert("qa-nightly".to_string(), item("URL_OLD"));
        local_platforms.insert("linux/amd64".to_string(), versions);
        let local = component(local_platforms);

        let mut remote_platforms = BTreeMap::new();
        let mut versions = BTreeMap::new();
        versions.insert("qa-nightly".to_string(), item("URL_NEW"));
        remote_platforms.insert("linux/amd64".to_string(), versions);
        let remote = component(remote_platforms);

        let merged = merge_component(&local, remote, &key, Utc::now()).unwrap();

        let url = &merged.signed.platforms["linux/amd64"]["qa-nightly"].url;
        assert_eq!(url, "URL_OLD");
    }

    #[test]
    fn new_platform_is_added_without_disturbing_existing_ones() {
        let key = repo_mirror_signer::generate_ed25519_for_test();
        let mut local_platforms = BTreeMap::new();
        let mut versions = BTreeMap::new();
        versions.insert("v1.0.0".to_string(), item("URL_A"));
        local_platforms.insert("linux/amd64".to_string(), versions);
        let local = component(local_platforms);

        let mut remote_platforms = BTreeMap::new();
        let mut versions = BTreeMap::new();
        versions.insert("v1.0.0".to_string(), item("URL_DARWIN"));
        remote_platforms.insert("darwin/arm64".to_string(), versions);
        let remote = component(remote_platforms);

        let merged = merge_component(&local, remote, &key, Utc::now()).unwrap();

        assert_eq!(
            merged.signed.platforms["linux/amd64"]["v1.0.0"].url,
            "URL_A"
        );
        assert_eq!(
            merged.signed.platforms["darwin/arm64"]["v1.0.0"].url,
            "URL_DARWIN"
        );
    }

    #[test]
    fn snapshot_merge_never_overwrites_local_meta() {
        let mut local = SnapshotSigned {
            version: NonZeroU64::new(1).unwrap(),
            expires: Utc::now(),
            meta: BTreeMap::new(),
        };
        local.meta.insert(
            "/foo.json".to_string(),
            repo_mirror_schema::FileVersion {
                version: NonZeroU64::new(2).unwrap(),
                length: 10,
            },
        );
        let mut remote = local.clone();
        remote.meta.insert(
            "/foo.json".to_string(),
            repo_mirror_schema::FileVersion {
                version: NonZeroU64::new(99).unwrap(),
                length: 999,
            },
        );
        remote.meta.insert(
            "/bar.json".to_string(),
            repo_mirror_schema::FileVersion {
                version: NonZeroU64::new(1).unwrap(),
                length: 5,
            },
        );

        merge_snapshot(&remote, &mut local);
        assert_eq!(local.meta["/foo.json"].version.get(), 2);
        assert_eq!(local.meta["/bar.json"].version.get(), 1);
    }
}
