//! Per-version rule table cache.
//!
//! Tables are loaded at most once per version. Reads go through an
//! [`ArcSwap`] snapshot and never take a lock; a miss takes the load guard,
//! re-checks, parses the file and publishes a new snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::{Result, TransformError};
use crate::rules::RuleTable;

type Tables = HashMap<String, Arc<RuleTable>>;

/// Load-once store of rule tables keyed by FHIR version.
pub struct RuleTableCache {
    rules_dir: PathBuf,
    tables: ArcSwap<Tables>,
    load_lock: Mutex<()>,
}

impl RuleTableCache {
    /// Creates an empty cache reading rule files from `rules_dir`.
    pub fn new(rules_dir: impl Into<PathBuf>) -> Self {
        Self {
            rules_dir: rules_dir.into(),
            tables: ArcSwap::from_pointee(Tables::new()),
            load_lock: Mutex::new(()),
        }
    }

    pub fn rules_dir(&self) -> &Path {
        &self.rules_dir
    }

    /// Path of the rule file for `version`.
    pub fn rule_file(&self, version: &str) -> PathBuf {
        self.rules_dir.join(format!("fhirbase-import-{version}.json"))
    }

    /// Returns the table for `version`, loading it on first use.
    pub fn get(&self, version: &str) -> Result<Arc<RuleTable>> {
        if let Some(table) = self.tables.load().get(version) {
            return Ok(Arc::clone(table));
        }
        self.load_once(version)
    }

    /// Loads the table for `version` now, so a bad version fails before a run.
    pub fn preload(&self, version: &str) -> Result<()> {
        self.get(version).map(|_| ())
    }

    /// Installs a table parsed elsewhere, replacing any cached one.
    pub fn insert(&self, version: impl Into<String>, table: RuleTable) -> Arc<RuleTable> {
        let table = Arc::new(table);
        let _guard = self.load_lock.lock();
        let mut next = Tables::clone(&self.tables.load());
        next.insert(version.into(), Arc::clone(&table));
        self.tables.store(Arc::new(next));
        table
    }

    pub fn is_loaded(&self, version: &str) -> bool {
        self.tables.load().contains_key(version)
    }

    fn load_once(&self, version: &str) -> Result<Arc<RuleTable>> {
        let _guard = self.load_lock.lock();

        // Another caller may have loaded it while we waited.
        let current = self.tables.load_full();
        if let Some(table) = current.get(version) {
            return Ok(Arc::clone(table));
        }

        let path = self.rule_file(version);
        if !path.is_file() {
            return Err(TransformError::missing_rule_table(version, path));
        }

        let table = Arc::new(RuleTable::from_file(&path)?);
        tracing::info!(
            version,
            path = %path.display(),
            entries = table.len(),
            "Loaded transformation rules"
        );

        let mut next = Tables::clone(&current);
        next.insert(version.to_string(), Arc::clone(&table));
        self.tables.store(Arc::new(next));
        Ok(table)
    }
}

impl std::fmt::Debug for RuleTableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.load();
        let mut versions: Vec<&String> = tables.keys().collect();
        versions.sort();
        f.debug_struct("RuleTableCache")
            .field("rules_dir", &self.rules_dir)
            .field("versions", &versions)
            .finish()
    }
}
