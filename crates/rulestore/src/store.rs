//! Durable rule store backed by a YAML document.

use crate::model::{NewRule, Rule, RuleUpdate};
use crate::snapshot::{SnapshotInfo, Snapshots};
use chrono::Utc;
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use validator::Validate;

/// Number of snapshots kept when not configured otherwise.
pub const DEFAULT_SNAPSHOT_RETENTION: usize = 10;

/// Persisted form of the rule collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesDocument {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Outcome of [`RuleStore::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl ValidationReport {
    fn ok() -> Self {
        Self {
            valid: true,
            diagnostic: None,
        }
    }

    fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            valid: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// Rule store.
///
/// Reads always go to disk. Mutations are serialized per instance and each
/// one snapshots the current document before writing the new one.
pub struct RuleStore {
    rules_path: PathBuf,
    snapshots: Snapshots,
    write_lock: Mutex<()>,
}

impl RuleStore {
    /// Open (or initialize) the store at `rules_path`.
    pub fn open(
        rules_path: impl Into<PathBuf>,
        snapshot_dir: impl Into<PathBuf>,
        retention: usize,
    ) -> Result<Self> {
        let store = Self {
            rules_path: rules_path.into(),
            snapshots: Snapshots::new(snapshot_dir.into(), retention),
            write_lock: Mutex::new(()),
        };

        if !store.rules_path.exists() {
            info!(path = %store.rules_path.display(), "Initializing empty rule document");
            store.save(&RulesDocument::default())?;
        }

        Ok(store)
    }

    /// Path of the live rule document.
    pub fn rules_path(&self) -> &Path {
        &self.rules_path
    }

    /// Directory holding snapshots.
    pub fn snapshot_dir(&self) -> &Path {
        self.snapshots.dir()
    }

    /// All rules in insertion order.
    pub fn list(&self) -> Result<Vec<Rule>> {
        Ok(self.load()?.rules)
    }

    pub fn get(&self, id: &str) -> Result<Rule> {
        self.load()?
            .rules
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::not_found(format!("rule {id}")))
    }

    pub fn get_by_path(&self, path: &str) -> Result<Rule> {
        self.load()?
            .rules
            .into_iter()
            .find(|r| r.path == path)
            .ok_or_else(|| Error::not_found(format!("rule with path {path}")))
    }

    /// Rules with `enabled == true`, in insertion order.
    pub fn enabled_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.list()?.into_iter().filter(|r| r.enabled).collect())
    }

    /// Add a rule. Fails with `DuplicatePath` if the path is taken.
    pub fn add(&self, candidate: NewRule) -> Result<Rule> {
        candidate.validate().map_err(Error::validation)?;

        let _guard = self.lock();
        let mut doc = self.load()?;

        if doc.rules.iter().any(|r| r.path == candidate.path) {
            return Err(Error::duplicate_path(format!(
                "path {} already exists",
                candidate.path
            )));
        }

        let id = match candidate.id.as_deref().map(str::trim) {
            Some("") => return Err(Error::validation("rule id must not be empty")),
            Some(id) if doc.rules.iter().any(|r| r.id == id) => {
                return Err(Error::validation(format!("rule id {id} already exists")));
            }
            Some(id) => id.to_string(),
            None => next_id(&doc.rules),
        };

        let rule = candidate.into_rule(id, Utc::now())?;

        self.snapshot()?;
        doc.rules.push(rule.clone());
        self.save(&doc)?;

        info!(rule_id = %rule.id, path = %rule.path, target = %rule.target(), "Rule added");
        Ok(rule)
    }

    /// Apply a partial update to rule `id`.
    pub fn update(&self, id: &str, changes: RuleUpdate) -> Result<Rule> {
        changes.validate().map_err(Error::validation)?;

        let _guard = self.lock();
        let mut doc = self.load()?;

        let idx = doc
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::not_found(format!("rule {id}")))?;

        if let Some(path) = changes.path.as_deref() {
            if path != doc.rules[idx].path
                && doc.rules.iter().any(|r| r.id != id && r.path == path)
            {
                return Err(Error::duplicate_path(format!("path {path} already exists")));
            }
        }

        let mut updated = doc.rules[idx].clone();
        changes.apply(&mut updated, Utc::now())?;

        self.snapshot()?;
        doc.rules[idx] = updated.clone();
        self.save(&doc)?;

        info!(rule_id = %id, path = %updated.path, "Rule updated");
        Ok(updated)
    }

    /// Delete rule `id`, returning the removed rule.
    pub fn delete(&self, id: &str) -> Result<Rule> {
        let _guard = self.lock();
        let mut doc = self.load()?;

        let idx = doc
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::not_found(format!("rule {id}")))?;

        self.snapshot()?;
        let removed = doc.rules.remove(idx);
        self.save(&doc)?;

        info!(rule_id = %id, path = %removed.path, "Rule deleted");
        Ok(removed)
    }

    /// Re-parse the persisted document and check its shape and invariants.
    pub fn validate(&self) -> ValidationReport {
        match fs::read_to_string(&self.rules_path) {
            Ok(text) => validate_document(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ValidationReport::ok(),
            Err(e) => ValidationReport::failed(format!("cannot read rule document: {e}")),
        }
    }

    /// Stored snapshots, newest first.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.snapshots.list()
    }

    /// Replace the live document with snapshot `name`.
    ///
    /// The current document is snapshotted first. If the restored document
    /// fails validation the call returns `InvalidState` naming that
    /// pre-restore snapshot; the restore itself is not undone.
    pub fn restore_snapshot(&self, name: &str) -> Result<()> {
        let _guard = self.lock();

        let content = self.snapshots.read(name)?;
        let backup = self.snapshot()?;
        self.write_atomic(&content)?;

        let report = self.validate();
        if !report.valid {
            let diagnostic = report.diagnostic.unwrap_or_default();
            warn!(snapshot = %name, backup = %backup, %diagnostic, "Restored snapshot is invalid");
            return Err(Error::invalid_state(format!(
                "restored snapshot {name} is invalid: {diagnostic} (previous rules saved as {backup})"
            )));
        }

        info!(snapshot = %name, backup = %backup, "Snapshot restored");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is (); a poisoned lock carries no broken state.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> Result<RulesDocument> {
        let text = match fs::read_to_string(&self.rules_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RulesDocument::default());
            }
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(RulesDocument::default());
        }
        serde_yaml::from_str(&text).map_err(|e| {
            Error::serialization(format!(
                "cannot parse {}: {}",
                self.rules_path.display(),
                e
            ))
        })
    }

    fn snapshot(&self) -> Result<String> {
        let content = match fs::read(&self.rules_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                serialize(&RulesDocument::default())?.into_bytes()
            }
            Err(e) => return Err(e.into()),
        };
        self.snapshots.take(&content)
    }

    fn save(&self, doc: &RulesDocument) -> Result<()> {
        let text = serialize(doc)?;
        self.write_atomic(text.as_bytes())
    }

    /// Write via a sibling temp file and rename.
    fn write_atomic(&self, content: &[u8]) -> Result<()> {
        let dir = self
            .rules_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = self
            .rules_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("rules.yaml");
        let tmp = dir.join(format!(".{file_name}.tmp"));

        let write = || -> std::io::Result<()> {
            fs::create_dir_all(dir)?;
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.rules_path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::write(format!("cannot write {}: {}", self.rules_path.display(), e))
        })
    }
}

/// Source of the currently enabled rules.
pub trait RuleSource: Send + Sync {
    fn enabled_rules(&self) -> Result<Vec<Rule>>;
}

impl RuleSource for RuleStore {
    fn enabled_rules(&self) -> Result<Vec<Rule>> {
        RuleStore::enabled_rules(self)
    }
}

impl RuleSource for Vec<Rule> {
    fn enabled_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.iter().filter(|r| r.enabled).cloned().collect())
    }
}

/// `max(numeric ids, 0) + 1`.
fn next_id(rules: &[Rule]) -> String {
    let max = rules
        .iter()
        .filter_map(|r| r.id.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    (max + 1).to_string()
}

fn serialize(doc: &RulesDocument) -> Result<String> {
    serde_yaml::to_string(doc).map_err(Error::serialization)
}

fn validate_document(text: &str) -> ValidationReport {
    let value: serde_yaml::Value = match serde_yaml::from_str(text) {
        Ok(value) => value,
        Err(e) => return ValidationReport::failed(format!("invalid YAML: {e}")),
    };

    let Some(root) = value.as_mapping() else {
        return ValidationReport::failed("document root must be a mapping");
    };
    let Some(rules) = root.get("rules") else {
        return ValidationReport::failed("document has no rules field");
    };
    let Some(rules) = rules.as_sequence() else {
        return ValidationReport::failed("rules must be a list");
    };

    let mut paths = HashSet::new();
    let mut ids = HashSet::new();
    for (idx, raw) in rules.iter().enumerate() {
        let rule: Rule = match serde_yaml::from_value(raw.clone()) {
            Ok(rule) => rule,
            Err(e) => return ValidationReport::failed(format!("rule {idx} is malformed: {e}")),
        };
        if let Err(e) = rule.validate() {
            return ValidationReport::failed(format!("rule {idx} is invalid: {e}"));
        }
        if !paths.insert(rule.path.clone()) {
            return ValidationReport::failed(format!("path {} is duplicated", rule.path));
        }
        if !ids.insert(rule.id.clone()) {
            return ValidationReport::failed(format!("id {} is duplicated", rule.id));
        }
    }

    ValidationReport::ok()
}
