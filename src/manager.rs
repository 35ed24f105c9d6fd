use std::{
    io::ErrorKind,
    path::{MAIN_SEPARATOR, Path, PathBuf},
    sync::Arc,
};

use chrono::TimeDelta;
use thiserror::Error;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    cookies::CookieReconciler,
    extractor::{Extractor, remove_job_files},
    jobs::{Clock, Job, JobState, JobStore, JobView, MediaKind, StoreError, Transition},
    normalizer::{NormalizePolicy, Normalizer},
};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_concurrent: usize,
    pub max_pending: usize,
    pub job_ttl: Duration,
    pub default_policy: NormalizePolicy,
    pub public_base_url: Option<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_pending: 32,
            job_ttl: Duration::from_secs(60 * 60),
            default_policy: NormalizePolicy::Always,
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub url: String,
    pub media_kind: MediaKind,
    /// Overrides the deployment policy for this job.
    pub normalize: Option<NormalizePolicy>,
    /// Netscape cookie store sent with the request. Takes precedence over the
    /// stores on disk and is never kept on the job record.
    pub cookies: Option<String>,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("too many jobs in progress, try again shortly")]
    QueueFull,
    #[error("job not found")]
    NotFound,
}

/// Owns the job table and drives every job from `queued` to a terminal state.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    cookies: CookieReconciler,
    extractor: Extractor,
    normalizer: Normalizer,
    extraction_slots: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    settings: Arc<ManagerSettings>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        cookies: CookieReconciler,
        extractor: Extractor,
        normalizer: Normalizer,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            clock,
            cookies,
            extractor,
            normalizer,
            extraction_slots: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            admission: Arc::new(Semaphore::new(settings.max_pending.max(1))),
            settings: Arc::new(settings),
        }
    }

    /// Registers a job and schedules it. Returns as soon as the job is queued.
    pub async fn create(&self, request: JobRequest) -> Result<JobView, JobError> {
        let (view, _handle) = self.submit(request).await?;
        Ok(view)
    }

    /// Like [`create`](Self::create) but returns only once the job is done or
    /// failed.
    pub async fn create_and_wait(&self, request: JobRequest) -> Result<JobView, JobError> {
        let (view, handle) = self.submit(request).await?;
        if let Err(join_error) = handle.await {
            error!("Worker for job {} stopped abnormally: {join_error}", view.job_id);
        }
        self.get(&view.job_id).await
    }

    async fn submit(&self, request: JobRequest) -> Result<(JobView, JoinHandle<()>), JobError> {
        let url = validate_url(&request.url)?;
        let permit = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|_| JobError::QueueFull)?;

        let job = Job::new(
            Uuid::new_v4().simple().to_string(),
            url,
            request.media_kind,
            request.normalize.unwrap_or(self.settings.default_policy),
            self.clock.now(),
        );
        let view = job.view(self.public_base_url());
        let id = job.id.clone();
        self.store.insert(job).await;
        info!("Job {id} queued ({:?})", request.media_kind);

        let manager = self.clone();
        let cookies = request.cookies;
        let handle = tokio::spawn(async move {
            manager.run(&id, cookies).await;
            drop(permit);
        });
        Ok((view, handle))
    }

    /// Executes one job to completion. Nothing escapes: collaborator errors
    /// and panics alike end up as the job's `error` state.
    pub async fn run(&self, id: &str, uploaded_cookies: Option<String>) {
        let worker = self.clone();
        let job_id = id.to_string();
        let outcome =
            tokio::spawn(async move { worker.execute(&job_id, uploaded_cookies).await }).await;

        let transition = match outcome {
            Ok(Ok(transition)) => transition,
            Ok(Err(detail)) => Transition::Fail { detail },
            Err(join_error) => Transition::Fail {
                detail: format!("worker crashed: {join_error}"),
            },
        };
        self.settle(id, transition).await;
    }

    async fn execute(
        &self,
        id: &str,
        uploaded_cookies: Option<String>,
    ) -> Result<Transition, String> {
        let job = self
            .store
            .get(id)
            .await
            .ok_or_else(|| "job disappeared before it started".to_string())?;

        let slot = Arc::clone(&self.extraction_slots)
            .acquire_owned()
            .await
            .map_err(|_| "worker pool is shut down".to_string())?;
        self.store
            .update(id, Transition::Start, self.clock.now())
            .await
            .map_err(|error| error.to_string())?;
        info!("Job {id} running");

        let raw = self.extract(&job, slot, uploaded_cookies).await?;

        let transition = if job.media_kind == MediaKind::Audio {
            debug!("Job {id}: audio, skipping normalization");
            Transition::Finish {
                artifact: raw,
                normalization: None,
                note: None,
            }
        } else {
            match self.normalizer.normalize(&raw, id, job.policy).await {
                Ok((artifact, action)) => Transition::Finish {
                    artifact,
                    normalization: Some(action),
                    note: None,
                },
                Err(error) => {
                    warn!("Job {id}: normalization failed, serving raw file: {error}");
                    Transition::Finish {
                        artifact: raw,
                        normalization: None,
                        note: Some(format!("normalize_failed: {error}")),
                    }
                }
            }
        };

        if let Transition::Finish { artifact, .. } = &transition {
            let size = tokio::fs::metadata(artifact)
                .await
                .map(|metadata| metadata.len())
                .unwrap_or(0);
            if size == 0 {
                return Err("the downloaded file is missing or empty".to_string());
            }
        }
        Ok(transition)
    }

    /// Cookie preparation and the yt-dlp ladder, both under the extraction
    /// slot. The cookie bundle is gone by the time this returns.
    async fn extract(
        &self,
        job: &Job,
        slot: OwnedSemaphorePermit,
        uploaded_cookies: Option<String>,
    ) -> Result<PathBuf, String> {
        let reconciler = self.cookies.clone();
        let url = job.source_url.clone();
        let cookies = tokio::task::spawn_blocking(move || match uploaded_cookies {
            Some(contents) => reconciler
                .from_upload(&url, &contents)
                .inspect_err(|error| warn!("Could not write uploaded cookies: {error}"))
                .ok()
                .or_else(|| reconciler.prepare(&url)),
            None => reconciler.prepare(&url),
        })
        .await
        .unwrap_or_else(|join_error| {
            warn!("Cookie preparation crashed: {join_error}");
            None
        });
        if let Some(bundle) = &cookies {
            let site = bundle.site().map_or("uploaded", |site| site.key());
            debug!("Job {}: using {site} cookies", job.id);
        }

        let result = self
            .extractor
            .invoke(&job.source_url, job.media_kind, cookies.as_ref(), &job.id)
            .await;
        let bundle_path = cookies.as_ref().map(|bundle| bundle.path().to_path_buf());
        drop(cookies);
        drop(slot);

        result.map_err(|error| match &bundle_path {
            Some(path) => error
                .to_string()
                .replace(&path.display().to_string(), "cookies.txt"),
            None => error.to_string(),
        })
    }

    /// Records the outcome. Tool output quoted in `detail` or `note` keeps
    /// file basenames only.
    async fn settle(&self, id: &str, transition: Transition) {
        let dir = self.extractor.output_dir();
        let transition = match transition {
            Transition::Fail { detail } => Transition::Fail {
                detail: scrub_paths(&detail, dir),
            },
            Transition::Finish {
                artifact,
                normalization,
                note,
            } => Transition::Finish {
                artifact,
                normalization,
                note: note.map(|note| scrub_paths(&note, dir)),
            },
            other => other,
        };

        if let Transition::Fail { .. } = &transition
            && let Some(job) = self.store.get(id).await
            && job.state == JobState::Queued
            && let Err(error) = self.store.update(id, Transition::Start, self.clock.now()).await
        {
            debug!("Job {id} could not be started before failing: {error}");
        }

        match self.store.update(id, transition, self.clock.now()).await {
            Ok(job) if job.state == JobState::Done => info!("Job {id} done"),
            Ok(job) => warn!(
                "Job {id} failed: {}",
                job.error_detail.as_deref().unwrap_or_default()
            ),
            Err(StoreError::NotFound(_)) => debug!("Job {id} was removed before it settled"),
            Err(error) => error!("Job {id} could not be settled: {error}"),
        }
    }

    pub async fn get(&self, id: &str) -> Result<JobView, JobError> {
        self.store
            .get(id)
            .await
            .map(|job| job.view(self.public_base_url()))
            .ok_or(JobError::NotFound)
    }

    /// Location of a finished job's file. Stays inside the crate: callers
    /// outside only ever see the job id.
    pub(crate) async fn artifact(&self, id: &str) -> Result<PathBuf, JobError> {
        let job = self.store.get(id).await.ok_or(JobError::NotFound)?;
        match (job.state, job.artifact_path) {
            (JobState::Done, Some(path)) => Ok(path),
            _ => Err(JobError::NotFound),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.store.count_active().await
    }

    /// Deletes every job that completed more than the TTL ago, together with
    /// its files. Returns how many jobs were removed.
    pub async fn reap_once(&self) -> usize {
        let now = self.clock.now();
        let Some(cutoff) = TimeDelta::from_std(self.settings.job_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
        else {
            return 0;
        };

        let expired = self.store.list_expired(cutoff).await;
        let dir = self.extractor.output_dir().to_path_buf();
        let mut removed = 0;

        for job in expired {
            if let Some(path) = &job.artifact_path
                && let Err(error) = tokio::fs::remove_file(path).await
                && error.kind() != ErrorKind::NotFound
            {
                warn!("Could not remove artifact of job {}: {error}", job.id);
            }
            remove_job_files(&dir, &job.id).await;
            if let Err(error) = tokio::fs::remove_dir_all(dir.join(&job.id)).await
                && error.kind() != ErrorKind::NotFound
            {
                warn!("Could not remove work directory of job {}: {error}", job.id);
            }

            if self.store.delete(&job.id).await.is_some() {
                debug!("Reaped job {}", job.id);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(
                "Reap pass removed {removed} job(s), {} left",
                self.store.len().await
            );
        }
        removed
    }

    fn public_base_url(&self) -> Option<&str> {
        self.settings.public_base_url.as_deref()
    }
}

/// Runs [`JobManager::reap_once`] every `every` for as long as the process
/// lives.
pub fn spawn_reaper(manager: JobManager, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = manager.reap_once().await;
            if removed > 0 {
                info!("Reaper removed {removed} expired job(s)");
            }
        }
    })
}

/// Removes every spelling of `dir` (as configured and canonical) from `text`.
fn scrub_paths(text: &str, dir: &Path) -> String {
    let mut spellings = vec![dir.to_path_buf()];
    if let Ok(canonical) = std::fs::canonicalize(dir)
        && canonical != dir
    {
        spellings.push(canonical);
    }

    let mut scrubbed = text.to_string();
    for spelling in spellings {
        let bare = spelling.display().to_string();
        if bare.is_empty() {
            continue;
        }
        let with_separator = if bare.ends_with(MAIN_SEPARATOR) {
            bare.clone()
        } else {
            format!("{bare}{MAIN_SEPARATOR}")
        };
        scrubbed = scrubbed.replace(&with_separator, "").replace(&bare, "");
    }
    scrubbed
}

pub(crate) fn validate_url(input: &str) -> Result<String, JobError> {
    let url = input.trim();
    if url.is_empty() {
        return Err(JobError::InvalidInput("url is required".to_string()));
    }

    let parsed = Url::parse(url)
        .map_err(|_| JobError::InvalidInput("url is not a valid URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(JobError::InvalidInput(
            "url must use http or https".to_string(),
        ));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(JobError::InvalidInput("url has no host".to_string()));
    }

    Ok(url.to_string())
}
