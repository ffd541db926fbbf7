//! Process-wide registry of in-flight session IDs. This is the arbiter for "at most one
//! uncommitted transaction per session ID" — it tracks which IDs are busy, not the
//! transactions themselves; `FsTxn::drop`/`commit`/`rollback` call back into `release` to
//! free the slot.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{self, Result};
use crate::fstxn::FsTxn;

pub struct SessionManager {
    active: Mutex<HashSet<String>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Reserves `id`. Fails with `SessionBusy` if it is already in flight.
    pub fn begin(&self, id: &str) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        if !active.insert(id.to_string()) {
            return error::SessionBusySnafu { id }.fail();
        }
        Ok(())
    }

    /// Loads a transaction for a previously-`begin`-reserved session ID, rooted at
    /// `root`.
    pub fn load(self: &Arc<Self>, id: &str, root: PathBuf) -> Result<FsTxn> {
        if !self.active.lock().unwrap().contains(id) {
            return error::NoSuchSessionSnafu { id }.fail();
        }
        Ok(FsTxn::new(id.to_string(), root, self.clone()))
    }

    pub(crate) fn release(&self, id: &str) {
        self.active.lock().unwrap().remove(id);
    }
}
