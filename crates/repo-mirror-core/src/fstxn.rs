//! A scoped, atomic batch of manifest writes over a directory.
//!
//! Staged writes live in memory, keyed in insertion order, until `commit` renames each
//! one into place in that order — so a concurrent reader never observes `timestamp.json`
//! naming bytes that don't match what's on disk for `snapshot.json`, nor `snapshot.json`
//! naming a versioned file that hasn't landed yet, as long as callers stage files in
//! dependency order (components/index, then snapshot, then timestamp). Dropping a
//! transaction without committing discards the staged writes and frees its session slot;
//! there is nothing on disk to clean up, since nothing is written until `commit`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use repo_mirror_schema::{from_json, to_canonical_json};
use serde::{de::DeserializeOwned, Serialize};
use snafu::{OptionExt, ResultExt};

use crate::error::{self, Result};
use crate::session::SessionManager;

pub struct FsTxn {
    root: PathBuf,
    id: String,
    dirty: IndexMap<String, Vec<u8>>,
    sessions: Arc<SessionManager>,
    released: bool,
}

impl FsTxn {
    pub(crate) fn new(id: String, root: PathBuf, sessions: Arc<SessionManager>) -> Self {
        FsTxn {
            root,
            id,
            dirty: IndexMap::new(),
            sessions,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reads `name`, falling through to the live mirror root if it isn't staged.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        if let Some(bytes) = self.dirty.get(name) {
            return Ok(bytes.clone());
        }
        fs::read(self.root.join(name)).map_err(|source| error::not_found_or_io(name, &self.root.join(name), source))
    }

    /// Reads only staged state; never falls through to the live mirror.
    pub fn read_local(&self, name: &str) -> Result<Vec<u8>> {
        self.dirty
            .get(name)
            .cloned()
            .context(error::NotFoundSnafu { name })
    }

    pub fn read_manifest<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let bytes = self.read(name)?;
        from_json(&bytes).context(error::CodecSnafu)
    }

    pub fn read_local_manifest<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let bytes = self.read_local(name)?;
        from_json(&bytes).context(error::CodecSnafu)
    }

    /// Size in bytes of `name`, falling through to the live mirror like `read`.
    pub fn stat(&self, name: &str) -> Result<u64> {
        if let Some(bytes) = self.dirty.get(name) {
            return Ok(bytes.len() as u64);
        }
        let path = self.root.join(name);
        fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|source| error::not_found_or_io(name, &path, source))
    }

    pub fn write(&mut self, name: &str, bytes: Vec<u8>) {
        self.dirty.insert(name.to_string(), bytes);
    }

    pub fn write_manifest<T: Serialize>(&mut self, name: &str, value: &T) -> Result<()> {
        let bytes = to_canonical_json(value).context(error::CodecSnafu)?;
        self.write(name, bytes);
        Ok(())
    }

    /// Atomically publishes every staged write, in the order it was staged.
    pub fn commit(mut self) -> Result<()> {
        for (name, bytes) in &self.dirty {
            write_atomically(&self.root, name, bytes)?;
        }
        self.released = true;
        self.sessions.release(&self.id);
        Ok(())
    }

    /// Discards every staged write. Equivalent to dropping the transaction.
    pub fn rollback(mut self) {
        self.released = true;
        self.sessions.release(&self.id);
    }
}

impl Drop for FsTxn {
    fn drop(&mut self) {
        if !self.released {
            self.sessions.release(&self.id);
        }
    }
}

fn write_atomically(root: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = Path::new(name).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(root.join(parent))
                .context(error::IoSnafu { path: root.join(parent) })?;
        }
    }
    let dest = root.join(name);
    let tmp = root.join(format!(".{}.tmp", name.replace('/', "_")));
    fs::write(&tmp, bytes).context(error::IoSnafu { path: tmp.clone() })?;
    fs::rename(&tmp, &dest).context(error::IoSnafu { path: dest })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;

    fn new_txn(root: &Path) -> (Arc<SessionManager>, FsTxn) {
        let sessions = Arc::new(SessionManager::new());
        sessions.begin("t1").unwrap();
        let txn = sessions.load("t1", root.to_path_buf()).unwrap();
        (sessions, txn)
    }

    #[test]
    fn write_then_commit_is_visible_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (_sessions, mut txn) = new_txn(dir.path());
        txn.write("a.json", b"hello".to_vec());
        txn.commit().unwrap();
        assert_eq!(fs::read(dir.path().join("a.json")).unwrap(), b"hello");
    }

    #[test]
    fn dropping_without_commit_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionManager::new());
        sessions.begin("t2").unwrap();
        {
            let mut txn = sessions.load("t2", dir.path().to_path_buf()).unwrap();
            txn.write("a.json", b"hello".to_vec());
        }
        assert!(!dir.path().join("a.json").exists());
        // session slot was freed by Drop, so a fresh Begin succeeds
        sessions.begin("t2").unwrap();
    }

    #[test]
    fn read_falls_through_to_live_root_but_read_local_does_not() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("live.json"), b"live").unwrap();
        let (_sessions, txn) = new_txn(dir.path());
        assert_eq!(txn.read("live.json").unwrap(), b"live");
        assert!(txn.read_local("live.json").is_err());
    }
}
