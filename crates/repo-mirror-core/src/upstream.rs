//! Wraps an upstream client; detects which manifest files it changed via modification-time
//! snapshots; single-flights concurrent refreshes; times out stuck downloads.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use snafu::ResultExt;

use crate::error::{self, Result};
use crate::singleflight::SingleFlight;

pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// The opaque upstream client: when `refresh` returns without error, it has populated the
/// manifests directory with the current upstream snapshot/timestamp/index and any changed
/// component files.
pub trait UpstreamClient: Send + Sync {
    fn refresh(&self) -> std::result::Result<(), String>;
}

pub struct UpstreamCache {
    manifests_dir: PathBuf,
    client: Arc<dyn UpstreamClient>,
    mtimes: Mutex<HashMap<String, SystemTime>>,
    single_flight: SingleFlight<HashMap<String, Vec<u8>>>,
}

impl UpstreamCache {
    pub fn new(manifests_dir: PathBuf, client: Arc<dyn UpstreamClient>) -> Result<Self> {
        fs::create_dir_all(&manifests_dir).context(error::IoSnafu {
            path: manifests_dir.clone(),
        })?;
        Ok(UpstreamCache {
            manifests_dir,
            client,
            mtimes: Mutex::new(HashMap::new()),
            single_flight: SingleFlight::new(),
        })
    }

    /// Returns the set of manifest files whose modification time changed since the last
    /// successful `update_cache_mtime`. Single-flighted under the tag `"updateUpstream"`.
    pub fn update_upstream(&self) -> Result<HashMap<String, Vec<u8>>> {
        self.single_flight
            .run("updateUpstream", || self.update_upstream_once())
            .map_err(|arc_err| {
                error::UpstreamSnafu {
                    message: arc_err.to_string(),
                }
                .build()
            })
    }

    /// Called only after a reconciliation commits, so a failed merge causes the next call
    /// to re-observe the same "changed" files.
    pub fn update_cache_mtime(&self) -> Result<()> {
        let mut mtimes = self.mtimes.lock().unwrap();
        for entry in fs::read_dir(&self.manifests_dir).context(error::IoSnafu {
            path: self.manifests_dir.clone(),
        })? {
            let entry = entry.context(error::IoSnafu {
                path: self.manifests_dir.clone(),
            })?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .context(error::IoSnafu { path: entry.path() })?;
            mtimes.insert(name, mtime);
        }
        Ok(())
    }

    fn update_upstream_once(&self) -> Result<HashMap<String, Vec<u8>>> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();
        thread::spawn(move || {
            let _ = tx.send(client.refresh());
        });

        match rx.recv_timeout(UPSTREAM_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return error::UpstreamSnafu { message }.fail(),
            Err(_) => {
                return error::TimeoutSnafu {
                    timeout: UPSTREAM_TIMEOUT,
                }
                .fail()
            }
        }

        self.collect_changed_files()
    }

    fn collect_changed_files(&self) -> Result<HashMap<String, Vec<u8>>> {
        let mtimes = self.mtimes.lock().unwrap();
        let mut changed = HashMap::new();
        for entry in fs::read_dir(&self.manifests_dir).context(error::IoSnafu {
            path: self.manifests_dir.clone(),
        })? {
            let entry = entry.context(error::IoSnafu {
                path: self.manifests_dir.clone(),
            })?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .context(error::IoSnafu { path: entry.path() })?;
            if mtimes.get(&name) != Some(&mtime) {
                let bytes = fs::read(entry.path()).context(error::IoSnafu { path: entry.path() })?;
                changed.insert(name, bytes);
            }
        }
        Ok(changed)
    }
}
