use serde::{Deserialize, Serialize};

/// The closed set of manifest roles. Each has exactly one active private signing key
/// loaded at startup, except `Root`, which this server never signs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Root,
    Index,
    Snapshot,
    Timestamp,
    Owner,
}

impl RoleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleType::Root => "root",
            RoleType::Index => "index",
            RoleType::Snapshot => "snapshot",
            RoleType::Timestamp => "timestamp",
            RoleType::Owner => "owner",
        }
    }
}

impl std::fmt::Display for RoleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
