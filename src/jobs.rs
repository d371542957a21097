//! In-memory registry of download jobs.
//!
//! Jobs live only as long as the process. The registry keeps them in
//! insertion order so the oldest pending job is always claimed first, and it
//! refuses to create a second active job for an entity that already has one.
//! Finished jobs stay queryable until the retention policy evicts them.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RetentionSettings;

/// Warnings beyond this are dropped; the log still has them.
const MAX_WARNINGS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Uploading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Downloading | Self::Uploading)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub entity_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of [`JobRegistry::enqueue`]. `created` is false when an active job
/// for the entity already existed and was returned instead.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub job: Job,
    pub created: bool,
}

/// What pollers get back for a job id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: String,
    pub entity_id: String,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            entity_id: job.entity_id.clone(),
            status: job.status,
            progress: job.progress,
            error: job.error.clone(),
            warnings: job.warnings.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<String, Job>,
    order: VecDeque<String>,
    counter: u64,
}

impl RegistryState {
    fn ordered(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    fn next_job_id(&mut self, now: DateTime<Utc>) -> String {
        self.counter += 1;
        format!("job_{}_{}", now.timestamp_millis(), self.counter)
    }

    fn remove(&mut self, evicted: &[String]) {
        if evicted.is_empty() {
            return;
        }
        for id in evicted {
            self.jobs.remove(id);
        }
        self.order.retain(|id| self.jobs.contains_key(id));
    }
}

pub struct JobRegistry {
    state: Mutex<RegistryState>,
    retention: RetentionSettings,
}

impl JobRegistry {
    /// At least one finished job is always kept so the last outcome stays
    /// queryable.
    pub fn new(retention: RetentionSettings) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            retention: RetentionSettings {
                max_finished: retention.max_finished.max(1),
                ..retention
            },
        }
    }

    /// Returns the active job for `entity_id` if there is one, otherwise
    /// inserts a fresh pending job. Both happen under the same lock.
    pub fn enqueue(&self, entity_id: &str) -> Enqueued {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .ordered()
            .find(|job| job.entity_id == entity_id && job.status.is_active())
        {
            return Enqueued {
                job: existing.clone(),
                created: false,
            };
        }

        let now = Utc::now();
        let job = Job {
            id: state.next_job_id(now),
            entity_id: entity_id.to_string(),
            status: JobStatus::Pending,
            progress: 0.0,
            error: None,
            warnings: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        state.order.push_back(job.id.clone());
        state.jobs.insert(job.id.clone(), job.clone());
        Enqueued { job, created: true }
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.state.lock().jobs.get(job_id).cloned()
    }

    pub fn find_active_by_entity(&self, entity_id: &str) -> Option<Job> {
        self.state
            .lock()
            .ordered()
            .find(|job| job.entity_id == entity_id && job.status.is_active())
            .cloned()
    }

    /// Oldest pending job by insertion order.
    pub fn next_pending(&self) -> Option<Job> {
        self.state
            .lock()
            .ordered()
            .find(|job| job.status == JobStatus::Pending)
            .cloned()
    }

    pub fn mark_downloading(&self, job_id: &str) -> bool {
        self.update(job_id, |job| {
            job.status = JobStatus::Downloading;
            job.progress = 0.0;
            job.started_at = Some(Utc::now());
        })
    }

    /// Raises the progress of a downloading job. Lower values are ignored so
    /// pollers never see it go backwards. Returns the progress after the
    /// update, or `None` when the job is not downloading.
    pub fn record_progress(&self, job_id: &str, percent: f64) -> Option<f64> {
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(job_id)?;
        if job.status != JobStatus::Downloading {
            return None;
        }
        if percent.is_finite() {
            job.progress = job.progress.max(percent.clamp(0.0, 100.0));
        }
        Some(job.progress)
    }

    pub fn mark_uploading(&self, job_id: &str) -> bool {
        self.update(job_id, |job| {
            job.status = JobStatus::Uploading;
            job.progress = 100.0;
        })
    }

    pub fn mark_completed(&self, job_id: &str) -> bool {
        let updated = self.update(job_id, |job| {
            job.status = JobStatus::Completed;
            job.progress = 100.0;
            job.completed_at = Some(Utc::now());
        });
        self.prune();
        updated
    }

    pub fn mark_failed(&self, job_id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        let updated = self.update(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error);
            job.completed_at = Some(Utc::now());
        });
        self.prune();
        updated
    }

    pub fn push_warning(&self, job_id: &str, warning: impl Into<String>) -> bool {
        let warning = warning.into();
        self.update(job_id, |job| {
            if job.warnings.len() < MAX_WARNINGS {
                job.warnings.push(warning);
            }
        })
    }

    /// All jobs in insertion order.
    pub fn snapshot(&self) -> Vec<Job> {
        self.state.lock().ordered().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies the retention policy. Runs automatically after every terminal
    /// transition.
    pub fn prune(&self) {
        self.prune_at(Utc::now());
    }

    fn prune_at(&self, now: DateTime<Utc>) {
        let max_age = TimeDelta::from_std(self.retention.max_age).unwrap_or(TimeDelta::MAX);
        let mut state = self.state.lock();

        let mut evicted: Vec<String> = state
            .ordered()
            .filter(|job| job.status.is_terminal())
            .filter(|job| {
                let finished = job.completed_at.unwrap_or(job.created_at);
                now.signed_duration_since(finished) > max_age
            })
            .map(|job| job.id.clone())
            .collect();

        let remaining: Vec<String> = state
            .ordered()
            .filter(|job| job.status.is_terminal() && !evicted.contains(&job.id))
            .map(|job| job.id.clone())
            .collect();
        let overflow = remaining.len().saturating_sub(self.retention.max_finished);
        evicted.extend(remaining.into_iter().take(overflow));

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicting finished jobs");
        }
        state.remove(&evicted);
    }

    fn update(&self, job_id: &str, apply: impl FnOnce(&mut Job)) -> bool {
        match self.state.lock().jobs.get_mut(job_id) {
            Some(job) => {
                apply(job);
                true
            }
            None => false,
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(RetentionSettings::default())
    }
}
