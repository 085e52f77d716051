//! Which keyspaces and tables a restore touches.
//!
//! Every manifest line names a `keyspace.table`. Tables are classified into
//! system, auth, schema and user tables, and the restore scenario (full or
//! subset, new or existing cluster) decides which classes are restored.

use crate::utils::{BackupError, Result};
use std::fmt;
use std::str::FromStr;

const SYSTEM_KEYSPACE: &str = "system";
const SYSTEM_AUTH_KEYSPACE: &str = "system_auth";
const SYSTEM_SCHEMA_KEYSPACE: &str = "system_schema";

/// Schema tables that lived in `system` before `system_schema` existed.
const LEGACY_SCHEMA_TABLES: [&str; 7] = [
    "schema_keyspaces",
    "schema_columnfamilies",
    "schema_columns",
    "schema_triggers",
    "schema_usertypes",
    "schema_functions",
    "schema_aggregates",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyspaceClass {
    System,
    SystemAuth,
    Schema,
    Other,
}

impl KeyspaceClass {
    pub fn of(keyspace: &str, table: &str) -> Self {
        match keyspace {
            SYSTEM_KEYSPACE if LEGACY_SCHEMA_TABLES.contains(&table) => KeyspaceClass::Schema,
            SYSTEM_KEYSPACE => KeyspaceClass::System,
            SYSTEM_AUTH_KEYSPACE => KeyspaceClass::SystemAuth,
            SYSTEM_SCHEMA_KEYSPACE => KeyspaceClass::Schema,
            _ => KeyspaceClass::Other,
        }
    }
}

/// A `keyspace.table` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyspaceTable {
    pub keyspace: String,
    pub table: String,
}

impl KeyspaceTable {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
        }
    }

    /// Derive the pair from a table directory name (`<table>-<id>` or `<table>`).
    pub fn from_table_dir(keyspace: &str, table_dir: &str) -> Self {
        let table = table_dir.split_once('-').map_or(table_dir, |(name, _)| name);
        Self::new(keyspace, table)
    }

    pub fn class(&self) -> KeyspaceClass {
        KeyspaceClass::of(&self.keyspace, &self.table)
    }
}

impl fmt::Display for KeyspaceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.table)
    }
}

/// Requested restore subset: whole keyspaces (`ks`) and single tables (`ks.table`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subset {
    entries: Vec<(String, Option<String>)>,
}

impl Subset {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, target: &KeyspaceTable) -> bool {
        self.entries.iter().any(|(keyspace, table)| {
            *keyspace == target.keyspace && table.as_ref().is_none_or(|t| *t == target.table)
        })
    }

    /// Keyspaces named by the subset, deduplicated, in first-seen order.
    pub fn keyspaces(&self) -> Vec<String> {
        let mut keyspaces: Vec<String> = Vec::new();
        for (keyspace, _) in &self.entries {
            if !keyspaces.contains(keyspace) {
                keyspaces.push(keyspace.clone());
            }
        }
        keyspaces
    }
}

impl FromStr for Subset {
    type Err = BackupError;

    /// Parse a comma separated list such as `ks1,ks2.users`.
    fn from_str(value: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let entry = match item.split_once('.') {
                Some((keyspace, table)) if !keyspace.is_empty() && !table.is_empty() => {
                    (keyspace.to_string(), Some(table.to_string()))
                }
                None => (item.to_string(), None),
                _ => {
                    return Err(BackupError::Config(format!(
                        "invalid keyspace/table '{item}', expected <keyspace> or <keyspace>.<table>"
                    )))
                }
            };
            entries.push(entry);
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreScenario {
    FullNew,
    FullExisting,
    SubsetNew,
    SubsetExisting,
}

impl RestoreScenario {
    pub fn classify(subset_requested: bool, existing_cluster: bool) -> Self {
        match (subset_requested, existing_cluster) {
            (false, false) => RestoreScenario::FullNew,
            (false, true) => RestoreScenario::FullExisting,
            (true, false) => RestoreScenario::SubsetNew,
            (true, true) => RestoreScenario::SubsetExisting,
        }
    }
}

/// Inclusion rule for one restore.
#[derive(Debug, Clone)]
pub struct RestorePredicate {
    scenario: RestoreScenario,
    subset: Subset,
    restore_system_keyspace: bool,
}

impl RestorePredicate {
    pub fn new(subset: Subset, existing_cluster: bool, restore_system_keyspace: bool) -> Self {
        Self {
            scenario: RestoreScenario::classify(!subset.is_empty(), existing_cluster),
            subset,
            restore_system_keyspace,
        }
    }

    pub fn scenario(&self) -> RestoreScenario {
        self.scenario
    }

    pub fn includes(&self, target: &KeyspaceTable) -> bool {
        let class = target.class();
        match self.scenario {
            RestoreScenario::FullNew | RestoreScenario::FullExisting => {
                self.restore_system_keyspace || class != KeyspaceClass::System
            }
            RestoreScenario::SubsetExisting => {
                self.subset.contains(target)
                    || (self.restore_system_keyspace && class == KeyspaceClass::Schema)
            }
            RestoreScenario::SubsetNew => {
                self.subset.contains(target)
                    || matches!(class, KeyspaceClass::SystemAuth | KeyspaceClass::Schema)
            }
        }
    }
}
