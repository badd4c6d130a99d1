//! Timestamped snapshots of the rule document.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PREFIX: &str = "rules_";
const SUFFIX: &str = ".yaml";

/// Metadata for one stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Snapshot directory with bounded retention.
#[derive(Debug, Clone)]
pub(crate) struct Snapshots {
    dir: PathBuf,
    retention: usize,
}

impl Snapshots {
    pub(crate) fn new(dir: PathBuf, retention: usize) -> Self {
        Self {
            dir,
            retention: retention.max(1),
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `content` as a new snapshot and prune the oldest beyond retention.
    pub(crate) fn take(&self, content: &[u8]) -> Result<String> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::write(format!(
                "cannot create snapshot dir {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string();
        let mut name = format!("{PREFIX}{stamp}{SUFFIX}");
        let mut n = 1;
        while self.dir.join(&name).exists() {
            name = format!("{PREFIX}{stamp}_{n}{SUFFIX}");
            n += 1;
        }

        let path = self.dir.join(&name);
        fs::write(&path, content).map_err(|e| {
            Error::write(format!("cannot write snapshot {}: {}", path.display(), e))
        })?;
        debug!(snapshot = %name, bytes = content.len(), "Snapshot taken");

        self.prune()?;
        Ok(name)
    }

    /// Read a snapshot's content by bare file name.
    pub(crate) fn read(&self, name: &str) -> Result<Vec<u8>> {
        if parse_name(name).is_none() {
            return Err(Error::not_found(format!("snapshot {name}")));
        }
        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("snapshot {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshots, newest first.
    pub(crate) fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let mut infos = Vec::new();
        for name in self.names()?.into_iter().rev() {
            let path = self.dir.join(&name);
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                // Pruned between listing and stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let created_at = parse_name(&name)
                .or_else(|| meta.modified().ok().map(DateTime::<Utc>::from))
                .unwrap_or_else(Utc::now);
            infos.push(SnapshotInfo {
                name,
                created_at,
                size_bytes: meta.len(),
            });
        }
        Ok(infos)
    }

    fn prune(&self) -> Result<()> {
        let names = self.names()?;
        if names.len() <= self.retention {
            return Ok(());
        }
        let excess = names.len() - self.retention;
        for name in &names[..excess] {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => debug!(snapshot = %name, "Pruned snapshot"),
                Err(e) => warn!(snapshot = %name, error = %e, "Failed to prune snapshot"),
            }
        }
        Ok(())
    }

    /// Snapshot file names, oldest first.
    fn names(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| parse_name(name).is_some())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Decode the timestamp from `rules_<YYYYmmdd>_<HHMMSS>_<micros>[_n].yaml`.
///
/// Returns `None` for anything else, including names with path separators.
pub(crate) fn parse_name(name: &str) -> Option<DateTime<Utc>> {
    if name.contains('/') || name.contains('\\') {
        return None;
    }
    let stem = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let mut parts = stem.split('_');
    let date = parts.next()?;
    let time = parts.next()?;
    let micros = parts.next()?;
    if let Some(seq) = parts.next() {
        seq.parse::<u32>().ok()?;
    }
    if parts.next().is_some() || date.len() != 8 || time.len() != 6 || micros.len() != 6 {
        return None;
    }

    let base = NaiveDateTime::parse_from_str(&format!("{date}{time}"), "%Y%m%d%H%M%S").ok()?;
    let micros: i64 = micros.parse().ok()?;
    Some((base + TimeDelta::microseconds(micros)).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_name() {
        let ts = parse_name("rules_20240102_030405_000006.yaml").unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day()), (2024, 1, 2));
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (3, 4, 5));
        assert_eq!(ts.nanosecond(), 6_000);

        assert!(parse_name("rules_20240102_030405_000006_2.yaml").is_some());
        assert!(parse_name("rules_20240102_030405.yaml").is_none());
        assert!(parse_name("../rules_20240102_030405_000006.yaml").is_none());
        assert!(parse_name("proxy_config.yaml").is_none());
        assert!(parse_name("rules_2024xx02_030405_000006.yaml").is_none());
    }

    #[test]
    fn test_retention_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = Snapshots::new(dir.path().to_path_buf(), 3);

        let mut taken = Vec::new();
        for i in 0..5 {
            taken.push(snapshots.take(format!("rules: [] # {i}\n").as_bytes()).unwrap());
        }

        let listed: Vec<String> = snapshots.list().unwrap().into_iter().map(|s| s.name).collect();
        let expected: Vec<String> = taken[2..].iter().rev().cloned().collect();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_read_unknown_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = Snapshots::new(dir.path().to_path_buf(), 10);

        let err = snapshots.read("rules_20240102_030405_000006.yaml").unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::NotFound);

        let err = snapshots.read("../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::NotFound);
    }
}
