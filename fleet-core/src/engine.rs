//! Job-execution engine seams.
//!
//! The coordination core never mutates job state directly: the authoritative
//! job-ID set and participant maps live behind the [`JobEngine`] trait, and
//! the active run behind [`JobRunner`]. The core only queries and signals
//! through these seams. An in-memory engine is provided for single-process
//! deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::directory::ClientRecord;
use crate::error::{FleetError, Result};
use crate::message::{TaskReply, TaskSubmission};
use crate::snapshot::RunSnapshot;

/// Summary of one participant within a job, keyed by session token.
#[derive(Debug, Clone)]
pub struct ParticipantSummary {
    pub token: String,
    pub name: String,
}

/// Per-running-job record held for the job's entire run.
#[derive(Debug, Clone, Default)]
pub struct JobProcessInfo {
    pub job_id: String,
    /// token -> participant summary
    pub participants: HashMap<String, ParticipantSummary>,
    pub finished: bool,
    pub error: bool,
}

impl JobProcessInfo {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    pub fn with_participant(mut self, token: &str, name: &str) -> Self {
        self.participants.insert(
            token.to_string(),
            ParticipantSummary {
                token: token.to_string(),
                name: name.to_string(),
            },
        );
        self
    }
}

/// Status of the active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Started,
    Stopped,
}

/// The server-side runner of the active job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Next task for this client, or the try-again sentinel.
    async fn process_task_request(&self, client: &ClientRecord) -> Result<TaskReply>;

    /// Accept a completed result from a client.
    async fn process_submission(
        &self,
        client: &ClientRecord,
        submission: TaskSubmission,
    ) -> Result<()>;

    /// A participating client's job process died.
    async fn handle_dead_job(&self, client_name: &str) -> Result<()>;

    /// Stop the run; `turn_to_cold` marks this as an HA switch-over.
    async fn abort(&self, turn_to_cold: bool);

    fn status(&self) -> RunnerStatus;
}

/// External job-execution engine consumed by the coordination core.
#[async_trait]
pub trait JobEngine: Send + Sync {
    /// The authoritative set of running job IDs.
    async fn running_jobs(&self) -> Vec<String>;

    async fn job_info(&self, job_id: &str) -> Option<JobProcessInfo>;

    /// One-way signal that a client is gone from a job's point of view.
    async fn notify_dead_job(&self, job_id: &str, client_name: &str, reason: &str) -> Result<()>;

    /// Stop a run outright (fatal client-side failure report).
    async fn stop_run(&self, job_id: &str) -> Result<()>;

    /// Resume a job from a restored snapshot (HA Cold->Hot).
    async fn restore_running_job(
        &self,
        job_id: &str,
        participants: &[String],
        snapshot: &RunSnapshot,
    ) -> Result<()>;

    /// Mark jobs that were running before failover but not restored.
    async fn update_abnormal_finished_jobs(&self, restored: &[String]) -> Result<()>;

    /// Mark all previously unfinished jobs finished (non-HA Cold->Hot).
    async fn update_unfinished_jobs(&self) -> Result<()>;

    /// Pause all server-side job activity (Hot->Cold).
    async fn pause_server_jobs(&self);

    async fn run_info(&self) -> Option<serde_json::Value>;

    async fn run_stats(&self) -> serde_json::Value;

    async fn errors(&self) -> Option<serde_json::Value>;

    async fn reset_errors(&self);
}

/// In-memory job engine for single-process deployments and tests.
#[derive(Default)]
pub struct InMemoryJobEngine {
    jobs: RwLock<HashMap<String, JobProcessInfo>>,
    dead_job_signals: Mutex<Vec<(String, String, String)>>,
    error_log: Mutex<Vec<String>>,
    paused: RwLock<bool>,
}

impl InMemoryJobEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_job(&self, info: JobProcessInfo) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(info.job_id.clone(), info);
    }

    pub async fn finish_job(&self, job_id: &str) {
        let mut jobs = self.jobs.write().await;
        jobs.remove(job_id);
    }

    pub async fn record_error(&self, message: impl Into<String>) {
        let mut errors = self.error_log.lock().await;
        errors.push(message.into());
    }

    /// Dead-job signals observed so far: (job_id, client_name, reason).
    pub async fn dead_job_signals(&self) -> Vec<(String, String, String)> {
        let signals = self.dead_job_signals.lock().await;
        signals.clone()
    }

    pub async fn is_paused(&self) -> bool {
        *self.paused.read().await
    }
}

#[async_trait]
impl JobEngine for InMemoryJobEngine {
    async fn running_jobs(&self) -> Vec<String> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|j| !j.finished)
            .map(|j| j.job_id.clone())
            .collect()
    }

    async fn job_info(&self, job_id: &str) -> Option<JobProcessInfo> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).cloned()
    }

    async fn notify_dead_job(&self, job_id: &str, client_name: &str, reason: &str) -> Result<()> {
        let mut signals = self.dead_job_signals.lock().await;
        signals.push((
            job_id.to_string(),
            client_name.to_string(),
            reason.to_string(),
        ));
        Ok(())
    }

    async fn stop_run(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(job) => {
                job.finished = true;
                Ok(())
            }
            None => Err(FleetError::execution(format!("no running job {}", job_id))),
        }
    }

    async fn restore_running_job(
        &self,
        job_id: &str,
        participants: &[String],
        _snapshot: &RunSnapshot,
    ) -> Result<()> {
        let mut info = JobProcessInfo::new(job_id);
        for name in participants {
            // Tokens are reissued when clients re-register after failover;
            // until then the participant is tracked by name.
            info.participants.insert(
                name.clone(),
                ParticipantSummary {
                    token: String::new(),
                    name: name.clone(),
                },
            );
        }
        let mut jobs = self.jobs.write().await;
        jobs.insert(job_id.to_string(), info);
        Ok(())
    }

    async fn update_abnormal_finished_jobs(&self, restored: &[String]) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        for job in jobs.values_mut() {
            if !restored.contains(&job.job_id) {
                job.finished = true;
                job.error = true;
            }
        }
        Ok(())
    }

    async fn update_unfinished_jobs(&self) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        for job in jobs.values_mut() {
            job.finished = true;
        }
        Ok(())
    }

    async fn pause_server_jobs(&self) {
        let mut paused = self.paused.write().await;
        *paused = true;
    }

    async fn run_info(&self) -> Option<serde_json::Value> {
        let jobs = self.jobs.read().await;
        if jobs.is_empty() {
            return None;
        }
        let ids: Vec<&str> = jobs.keys().map(String::as_str).collect();
        Some(serde_json::json!({ "running_jobs": ids }))
    }

    async fn run_stats(&self) -> serde_json::Value {
        let jobs = self.jobs.read().await;
        serde_json::json!({
            "job_count": jobs.len(),
            "finished": jobs.values().filter(|j| j.finished).count(),
        })
    }

    async fn errors(&self) -> Option<serde_json::Value> {
        let errors = self.error_log.lock().await;
        if errors.is_empty() {
            None
        } else {
            Some(serde_json::json!(errors.clone()))
        }
    }

    async fn reset_errors(&self) {
        let mut errors = self.error_log.lock().await;
        errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_running_jobs_excludes_finished() {
        let engine = InMemoryJobEngine::new();
        engine.start_job(JobProcessInfo::new("job-1")).await;
        engine.start_job(JobProcessInfo::new("job-2")).await;
        engine.stop_run("job-1").await.unwrap();

        let running = engine.running_jobs().await;
        assert_eq!(running, vec!["job-2".to_string()]);
    }

    #[tokio::test]
    async fn test_dead_job_signal_recorded() {
        let engine = InMemoryJobEngine::new();
        engine
            .notify_dead_job("job-1", "site-a", "client dead")
            .await
            .unwrap();
        let signals = engine.dead_job_signals().await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].0, "job-1");
        assert_eq!(signals[0].2, "client dead");
    }

    #[tokio::test]
    async fn test_abnormal_finish_marks_unrestored() {
        let engine = InMemoryJobEngine::new();
        engine.start_job(JobProcessInfo::new("job-1")).await;
        engine.start_job(JobProcessInfo::new("job-2")).await;
        engine
            .update_abnormal_finished_jobs(&["job-1".to_string()])
            .await
            .unwrap();

        let info = engine.job_info("job-2").await.unwrap();
        assert!(info.finished);
        assert!(info.error);
        let info = engine.job_info("job-1").await.unwrap();
        assert!(!info.finished);
    }

    #[tokio::test]
    async fn test_error_log_reset() {
        let engine = InMemoryJobEngine::new();
        assert!(engine.errors().await.is_none());
        engine.record_error("boom").await;
        assert!(engine.errors().await.is_some());
        engine.reset_errors().await;
        assert!(engine.errors().await.is_none());
    }
}
