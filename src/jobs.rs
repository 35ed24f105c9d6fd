use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::normalizer::{NormalizeAction, NormalizePolicy};

pub const MAX_ERROR_DETAIL_CHARS: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Error)
    }
}

/// Everything the worker knows about one download. Lives in memory only, so a
/// restart forgets every job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source_url: String,
    pub media_kind: MediaKind,
    pub policy: NormalizePolicy,
    pub state: JobState,
    pub artifact_path: Option<PathBuf>,
    pub error_detail: Option<String>,
    pub note: Option<String>,
    pub normalization: Option<NormalizeAction>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum Transition {
    Start,
    Finish {
        artifact: PathBuf,
        normalization: Option<NormalizeAction>,
        note: Option<String>,
    },
    Fail {
        detail: String,
    },
}

impl Transition {
    fn label(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Finish { .. } => "finish",
            Transition::Fail { .. } => "fail",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("job in state {from:?} cannot {attempted}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub attempted: &'static str,
}

impl Job {
    pub fn new(
        id: String,
        source_url: String,
        media_kind: MediaKind,
        policy: NormalizePolicy,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source_url,
            media_kind,
            policy,
            state: JobState::Queued,
            artifact_path: None,
            error_detail: None,
            note: None,
            normalization: None,
            created_at,
            completed_at: None,
        }
    }

    /// Moves the job along `Queued -> Running -> Done | Error`. Terminal
    /// states accept nothing.
    pub fn apply(
        &mut self,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        let from = self.state;
        match transition {
            Transition::Start if from == JobState::Queued => {
                self.state = JobState::Running;
            }
            Transition::Finish {
                artifact,
                normalization,
                note,
            } if from == JobState::Running => {
                self.state = JobState::Done;
                self.artifact_path = Some(artifact);
                self.normalization = normalization;
                self.note = note;
                self.completed_at = Some(now);
            }
            Transition::Fail { detail } if from == JobState::Running => {
                self.state = JobState::Error;
                self.error_detail = Some(truncate_detail(&detail, MAX_ERROR_DETAIL_CHARS));
                self.completed_at = Some(now);
            }
            other => {
                return Err(InvalidTransition {
                    from,
                    attempted: other.label(),
                });
            }
        }
        Ok(())
    }

    pub fn view(&self, public_base_url: Option<&str>) -> JobView {
        let done = self.state == JobState::Done;
        let download_url = done.then(|| match public_base_url {
            Some(base) => format!("{}/files/{}", base.trim_end_matches('/'), self.id),
            None => format!("/files/{}", self.id),
        });
        let filename = self
            .artifact_path
            .as_ref()
            .filter(|_| done)
            .and_then(|path| path.file_name())
            .and_then(|name| name.to_str())
            .map(ToString::to_string);

        JobView {
            job_id: self.id.clone(),
            status: self.state,
            media_kind: self.media_kind,
            created_at: self.created_at,
            completed_at: self.completed_at,
            error: self.error_detail.clone(),
            download_reference: done.then(|| self.id.clone()),
            download_url,
            filename,
            note: self.note.clone(),
            normalization: self.normalization,
        }
    }
}

/// What callers outside the worker get to see. Never carries a filesystem
/// path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobState,
    pub media_kind: MediaKind,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormalizeAction>,
}

pub fn truncate_detail(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// Job table. Every mutation happens under the store's own lock so readers,
/// workers and the reaper never observe half-applied transitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job);
    async fn get(&self, id: &str) -> Option<Job>;
    async fn update(
        &self,
        id: &str,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;
    async fn delete(&self, id: &str) -> Option<Job>;
    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Vec<Job>;
    async fn count_active(&self) -> usize;
    async fn len(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) {
        self.jobs.lock().await.insert(job.id.clone(), job);
    }

    async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.lock().await.get(id).cloned()
    }

    async fn update(
        &self,
        id: &str,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        job.apply(transition, now)?;
        Ok(job.clone())
    }

    async fn delete(&self, id: &str) -> Option<Job> {
        self.jobs.lock().await.remove(id)
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Vec<Job> {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|job| job.completed_at.is_some_and(|completed| completed < cutoff))
            .cloned()
            .collect()
    }

    async fn count_active(&self) -> usize {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|job| !job.state.is_terminal())
            .count()
    }

    async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
