//! Durable storage for reports and screenshots.
//!
//! A run directory holds:
//! - `reports/tc{id:04}_{env}.json`: one report per (objective, environment)
//! - `screenshots/tc{id:04}_{env}_{attempt}_{phase}.png`: captures per attempt
//!   phase, never overwritten by a later attempt
//! - `.run.json`: when and where the directory was created
//!
//! Every write goes to a temp file in the target directory and is renamed into
//! place, so readers see either the previous file or the new one.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::report::ExecutionReport;

/// Result type for artifact operations
pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Errors raised while reading or writing artifacts
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to persist artifact: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Point in an attempt a screenshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
    Final,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Before => "before",
            Phase::After => "after",
            Phase::Final => "final",
        }
    }
}

/// File layout for one run directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory tree and run metadata
    pub fn init(&self) -> ArtifactResult<()> {
        fs::create_dir_all(self.dir.join("reports"))?;
        fs::create_dir_all(self.dir.join("screenshots"))?;

        let meta_path = self.dir.join(".run.json");
        if !meta_path.exists() {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            let metadata = serde_json::json!({
                "created": chrono::Utc::now().to_rfc3339(),
                "host": host,
                "version": env!("CARGO_PKG_VERSION"),
            });
            write_atomic(&meta_path, serde_json::to_string_pretty(&metadata)?.as_bytes())?;
        }
        Ok(())
    }

    /// Canonical report location for (objective, environment)
    pub fn report_path(&self, test_case_id: u64, environment: &str) -> PathBuf {
        self.dir
            .join("reports")
            .join(format!("{}.json", stem(test_case_id, environment)))
    }

    /// Screenshot reference relative to the run directory
    pub fn screenshot_ref(&self, test_case_id: u64, environment: &str, attempt: &str, phase: Phase) -> String {
        format!(
            "screenshots/{}_{}_{}.png",
            stem(test_case_id, environment),
            sanitize_name(attempt),
            phase.as_str()
        )
    }

    pub fn resolve(&self, reference: &str) -> PathBuf {
        self.dir.join(reference)
    }

    /// Write a screenshot for `report`'s attempt, returning its reference
    pub fn save_screenshot(&self, report: &ExecutionReport, phase: Phase, png: &[u8]) -> ArtifactResult<String> {
        let reference = self.screenshot_ref(report.test_case_id, &report.environment, &report.attempt, phase);
        write_atomic(&self.resolve(&reference), png)?;
        Ok(reference)
    }

    /// Write a report to its canonical location, replacing any previous one
    pub fn save_report(&self, report: &ExecutionReport) -> ArtifactResult<PathBuf> {
        let path = self.report_path(report.test_case_id, &report.environment);
        write_atomic(&path, serde_json::to_string_pretty(report)?.as_bytes())?;
        debug!(path = %path.display(), status = %report.status, "report saved");
        Ok(path)
    }

    pub fn load_report(&self, test_case_id: u64, environment: &str) -> ArtifactResult<Option<ExecutionReport>> {
        let path = self.report_path(test_case_id, environment);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Every stored report, ordered by file name
    pub fn list_reports(&self) -> ArtifactResult<Vec<ExecutionReport>> {
        let reports_dir = self.dir.join("reports");
        if !reports_dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&reports_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut reports = Vec::with_capacity(paths.len());
        for path in paths {
            let data = fs::read_to_string(&path)?;
            reports.push(serde_json::from_str(&data)?);
        }
        Ok(reports)
    }

    /// Stored reports for one objective across environments
    pub fn reports_for(&self, test_case_id: u64) -> ArtifactResult<Vec<ExecutionReport>> {
        Ok(self
            .list_reports()?
            .into_iter()
            .filter(|r| r.test_case_id == test_case_id)
            .collect())
    }
}

fn stem(test_case_id: u64, environment: &str) -> String {
    format!("tc{:04}_{}", test_case_id, sanitize_name(environment))
}

/// Sanitize a name for use in filenames
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Write `bytes` to `path` through a sibling temp file and rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> ArtifactResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::EnvironmentProfile;
    use crate::objective::TestObjective;
    use crate::report::Status;
    use pretty_assertions::assert_eq;

    fn report(id: u64, env: &EnvironmentProfile) -> ExecutionReport {
        ExecutionReport::new(&TestObjective::generated(id, "objective", "expected"), env)
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Desktop"), "Desktop");
        assert_eq!(sanitize_name("Phone XL/landscape"), "Phone_XL_landscape");
    }

    #[test]
    fn test_paths() {
        let store = ArtifactStore::new("/tmp/run");
        assert_eq!(
            store.report_path(7, "Mobile"),
            PathBuf::from("/tmp/run/reports/tc0007_Mobile.json")
        );
        assert_eq!(
            store.screenshot_ref(1001, "Desktop", "20261015T093000123456", Phase::After),
            "screenshots/tc1001_Desktop_20261015T093000123456_after.png"
        );
    }

    #[test]
    fn test_init_writes_run_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.init().unwrap();
        assert!(dir.path().join("reports").is_dir());
        assert!(dir.path().join("screenshots").is_dir());

        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(".run.json")).unwrap()).unwrap();
        assert!(meta["created"].is_string());
    }

    #[test]
    fn test_save_report_overwrites_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let env = EnvironmentProfile::mobile();

        let mut r = report(3, &env);
        store.save_report(&r).unwrap();
        r.finalize(Status::Passed, "ok");
        store.save_report(&r).unwrap();

        let loaded = store.load_report(3, "Mobile").unwrap().unwrap();
        assert_eq!(loaded.status, Status::Passed);
        assert_eq!(store.list_reports().unwrap().len(), 1);
        assert!(store.load_report(3, "Desktop").unwrap().is_none());
    }

    #[test]
    fn test_reports_for_filters_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save_report(&report(1, &EnvironmentProfile::desktop())).unwrap();
        store.save_report(&report(1, &EnvironmentProfile::mobile())).unwrap();
        store.save_report(&report(2, &EnvironmentProfile::desktop())).unwrap();

        let for_one = store.reports_for(1).unwrap();
        assert_eq!(for_one.len(), 2);
        assert!(for_one.iter().all(|r| r.test_case_id == 1));
    }

    #[test]
    fn test_save_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let reference = store
            .save_screenshot(&report(5, &EnvironmentProfile::desktop()), Phase::Final, b"png")
            .unwrap();
        assert_eq!(fs::read(store.resolve(&reference)).unwrap(), b"png");
    }

    #[test]
    fn test_later_attempt_keeps_earlier_screenshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let env = EnvironmentProfile::desktop();

        let mut first = report(5, &env);
        first.attempt = "20261015T093000000001".to_string();
        let mut second = report(5, &env);
        second.attempt = "20261015T093100000001".to_string();

        let a = store.save_screenshot(&first, Phase::Final, b"first").unwrap();
        let b = store.save_screenshot(&second, Phase::Final, b"second").unwrap();
        assert_ne!(a, b);
        assert_eq!(fs::read(store.resolve(&a)).unwrap(), b"first");
        assert_eq!(fs::read(store.resolve(&b)).unwrap(), b"second");
    }
}
