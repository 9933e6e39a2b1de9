//! Job progress tracking, observable while a job runs.
//!
//! Every job moves through three sequential stages, `extract → recognize →
//! assemble`, each progressing from 0 to 100 with a short status line. The
//! [`ProgressRegistry`] holds one [`JobProgress`] per content hash and is
//! shared by the orchestrator, its page workers and any number of readers
//! (CLI progress bars, a status endpoint).
//!
//! # Consistency
//!
//! All writes for a job happen under one write lock, so a reader never sees a
//! half-updated stage and concurrent page completions are never lost. Readers
//! get a cloned snapshot: possibly stale, never torn. Stage progress only
//! moves forward; a late write with a smaller value keeps the larger one.
//!
//! # Example
//!
//! ```rust
//! use doclayout::{ProgressRegistry, Stage};
//!
//! let registry = ProgressRegistry::new();
//! registry.begin("1a2b3c4d").unwrap();
//! registry.update("1a2b3c4d", Stage::Extract, 100.0, "Extracted 3 pages");
//!
//! let snap = registry.snapshot("1a2b3c4d");
//! assert_eq!(snap.extract.progress, 100.0);
//! assert!(!snap.complete);
//! ```

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The three named stages of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Recognize,
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Extract => "extract",
            Stage::Recognize => "recognize",
            Stage::Assemble => "assemble",
        })
    }
}

/// Progress of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    /// 0–100.
    pub progress: f32,
    pub status: String,
}

impl StageProgress {
    fn waiting() -> Self {
        Self {
            progress: 0.0,
            status: "Waiting".into(),
        }
    }

    fn unknown() -> Self {
        Self {
            progress: 0.0,
            status: "Unknown".into(),
        }
    }
}

/// Snapshot of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub extract: StageProgress,
    pub recognize: StageProgress,
    pub assemble: StageProgress,
    /// Latest human-readable log line.
    pub log: String,
    /// Terminal flag, set on success and on failure.
    pub complete: bool,
    /// Set when the job failed.
    pub error: Option<String>,
    /// Pages recognised so far.
    pub completed_pages: usize,
    pub filename: Option<String>,
    pub total_pages: Option<usize>,
    pub processing_time_secs: Option<f64>,
}

impl JobProgress {
    fn started() -> Self {
        Self {
            extract: StageProgress::waiting(),
            recognize: StageProgress::waiting(),
            assemble: StageProgress::waiting(),
            log: String::new(),
            complete: false,
            error: None,
            completed_pages: 0,
            filename: None,
            total_pages: None,
            processing_time_secs: None,
        }
    }

    /// What readers see for a hash nobody registered.
    pub fn unknown() -> Self {
        Self {
            extract: StageProgress::unknown(),
            recognize: StageProgress::unknown(),
            assemble: StageProgress::unknown(),
            ..Self::started()
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageProgress {
        match stage {
            Stage::Extract => &self.extract,
            Stage::Recognize => &self.recognize,
            Stage::Assemble => &self.assemble,
        }
    }

    fn stage_mut(&mut self, stage: Stage) -> &mut StageProgress {
        match stage {
            Stage::Extract => &mut self.extract,
            Stage::Recognize => &mut self.recognize,
            Stage::Assemble => &mut self.assemble,
        }
    }

    /// `true` once the job finished without error.
    pub fn succeeded(&self) -> bool {
        self.complete && self.error.is_none()
    }
}

/// Concurrency-safe store of job progress, keyed by content hash.
///
/// Cloning shares the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct ProgressRegistry {
    jobs: Arc<RwLock<HashMap<String, JobProgress>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Every update is a set of plain assignments under one guard; a poisoned
    // map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, JobProgress>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, JobProgress>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new run of `hash_id`.
    ///
    /// A finished job with the same hash is replaced; a running one is not.
    pub fn begin(&self, hash_id: &str) -> Result<(), PipelineError> {
        let mut jobs = self.write();
        if let Some(existing) = jobs.get(hash_id) {
            if !existing.complete {
                return Err(PipelineError::JobAlreadyRunning {
                    hash_id: hash_id.to_string(),
                });
            }
        }
        jobs.insert(hash_id.to_string(), JobProgress::started());
        Ok(())
    }

    /// Set a stage's progress and status; progress never decreases.
    pub fn update(&self, hash_id: &str, stage: Stage, progress: f32, status: impl Into<String>) {
        let status = status.into();
        let mut jobs = self.write();
        if let Some(job) = jobs.get_mut(hash_id) {
            let s = job.stage_mut(stage);
            s.progress = s.progress.max(progress.clamp(0.0, 100.0));
            s.status = status.clone();
            job.log = status;
        }
    }

    /// Record one more recognised page out of `total` and return the count.
    pub fn page_done(&self, hash_id: &str, total: usize) -> usize {
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(hash_id) else {
            return 0;
        };
        job.completed_pages += 1;
        let done = job.completed_pages;
        let pct = if total == 0 {
            100.0
        } else {
            (done as f32 / total as f32 * 100.0).min(100.0)
        };
        job.recognize.progress = job.recognize.progress.max(pct);
        job.recognize.status = format!("Recognized {done}/{total} pages");
        job.log = job.recognize.status.clone();
        done
    }

    /// Replace the latest log line without touching stage progress.
    pub fn log(&self, hash_id: &str, line: impl Into<String>) {
        if let Some(job) = self.write().get_mut(hash_id) {
            job.log = line.into();
        }
    }

    /// Mark the job as successfully completed.
    pub fn finish(&self, hash_id: &str, filename: &str, total_pages: usize, secs: f64) {
        if let Some(job) = self.write().get_mut(hash_id) {
            job.complete = true;
            job.filename = Some(filename.to_string());
            job.total_pages = Some(total_pages);
            job.processing_time_secs = Some(secs);
            job.log = format!("Completed in {secs:.1}s");
        }
    }

    /// Mark the job as failed. Also terminal.
    pub fn fail(&self, hash_id: &str, error: impl Into<String>) {
        let error = error.into();
        if let Some(job) = self.write().get_mut(hash_id) {
            job.complete = true;
            job.log = format!("Error: {error}");
            job.error = Some(error);
        }
    }

    /// Current state of `hash_id`, or [`JobProgress::unknown`].
    pub fn snapshot(&self, hash_id: &str) -> JobProgress {
        self.read()
            .get(hash_id)
            .cloned()
            .unwrap_or_else(JobProgress::unknown)
    }

    /// Hashes of all tracked jobs, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_hash_reports_unknown_status() {
        let snap = ProgressRegistry::new().snapshot("deadbeef");
        assert_eq!(snap.extract.status, "Unknown");
        assert_eq!(snap.recognize.progress, 0.0);
        assert!(!snap.complete);
    }

    #[test]
    fn progress_is_monotonic() {
        let r = ProgressRegistry::new();
        r.begin("a").unwrap();
        r.update("a", Stage::Assemble, 60.0, "Saving Markdown");
        r.update("a", Stage::Assemble, 40.0, "late write");
        let snap = r.snapshot("a");
        assert_eq!(snap.assemble.progress, 60.0);
        assert_eq!(snap.assemble.status, "late write");
        assert_eq!(snap.log, "late write");
    }

    #[test]
    fn running_job_cannot_restart() {
        let r = ProgressRegistry::new();
        r.begin("a").unwrap();
        assert!(matches!(
            r.begin("a"),
            Err(PipelineError::JobAlreadyRunning { .. })
        ));
        r.finish("a", "doc.pdf", 3, 1.5);
        assert!(r.begin("a").is_ok());
        assert!(!r.snapshot("a").complete);
    }

    #[test]
    fn log_line_leaves_stages_alone() {
        let r = ProgressRegistry::new();
        r.begin("a").unwrap();
        r.update("a", Stage::Recognize, 25.0, "Recognizing 4 pages with 4 workers");
        r.log("a", "Processing page 3");
        r.log("unknown", "ignored");
        let snap = r.snapshot("a");
        assert_eq!(snap.log, "Processing page 3");
        assert_eq!(snap.recognize.progress, 25.0);
        assert_eq!(snap.recognize.status, "Recognizing 4 pages with 4 workers");
        assert_eq!(r.job_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn failure_is_terminal() {
        let r = ProgressRegistry::new();
        r.begin("a").unwrap();
        r.fail("a", "Rasterisation failed");
        let snap = r.snapshot("a");
        assert!(snap.complete);
        assert!(!snap.succeeded());
        assert_eq!(snap.error.as_deref(), Some("Rasterisation failed"));
    }

    #[test]
    fn concurrent_page_completions_are_not_lost() {
        let r = ProgressRegistry::new();
        r.begin("a").unwrap();
        let total = 64;
        std::thread::scope(|s| {
            for _ in 0..total {
                let r = r.clone();
                s.spawn(move || {
                    r.page_done("a", total);
                });
            }
        });
        let snap = r.snapshot("a");
        assert_eq!(snap.completed_pages, total);
        assert_eq!(snap.recognize.progress, 100.0);
    }

    #[test]
    fn snapshot_serialises_stage_names() {
        let r = ProgressRegistry::new();
        r.begin("a").unwrap();
        let json = serde_json::to_value(r.snapshot("a")).unwrap();
        assert!(json.get("extract").is_some());
        assert!(json.get("recognize").is_some());
        assert!(json.get("assemble").is_some());
    }
}
