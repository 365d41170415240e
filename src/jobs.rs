//! Request validation plus the supervised background task that takes a job
//! from `pending` to a terminal state.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::download::{self, DownloadOptions, DownloadedFile, OutputFormat};
use crate::error::{DownloadError, ToolError, ValidationError};
use crate::media_info::{self, VideoInfo};
use crate::platform::{self, Platform};
use crate::process::ToolRunner;
use crate::settings::SettingsStore;
use crate::store::{CompletedJob, DownloadJob, JobStore, NewJob};

const CRASHED_MESSAGE: &str = "Download task crashed unexpectedly";

/// Body of `POST /api/download`. Everything is optional so that missing
/// fields surface as validation errors rather than deserialisation failures.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
    pub custom_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submitted {
    pub id: String,
    pub platform: Platform,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum InfoError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Requires a non-blank, absolute URL.
pub fn validate_url(raw: Option<&str>) -> Result<String, ValidationError> {
    let url = raw
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ValidationError::MissingUrl)?;
    url::Url::parse(url).map_err(|_| ValidationError::InvalidUrl)?;
    Ok(url.to_string())
}

/// `512 B`, `1.50 KB`, `3.25 MB`, `1.00 GB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = UNITS[0];
    for candidate in UNITS {
        value /= 1024.0;
        unit = candidate;
        if value < 1024.0 {
            break;
        }
    }
    format!("{value:.2} {unit}")
}

/// Message stored on a failed job.
fn failure_message(err: &DownloadError) -> String {
    match err {
        DownloadError::Tool(ToolError::TimedOut { after, .. }) => {
            format!("Download timed out after {} s", after.as_secs())
        }
        other => other.to_string(),
    }
}

#[derive(Clone)]
pub struct DownloadService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    jobs: JobStore,
    settings: Arc<SettingsStore>,
    download_runner: ToolRunner,
    info_runner: ToolRunner,
    active: AtomicUsize,
}

/// Keeps the active-job counter honest even when the task unwinds.
struct ActiveGuard(Arc<ServiceInner>);

impl ActiveGuard {
    fn enter(inner: Arc<ServiceInner>) -> Self {
        inner.active.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DownloadService {
    pub fn new(
        jobs: JobStore,
        settings: Arc<SettingsStore>,
        download_runner: ToolRunner,
        info_runner: ToolRunner,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                jobs,
                settings,
                download_runner,
                info_runner,
                active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.inner.jobs
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    /// Downloads that have been accepted and not yet reached a terminal state.
    pub fn active_jobs(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Validated metadata lookup for the info endpoint.
    pub async fn fetch_info(&self, url: Option<&str>) -> Result<VideoInfo, InfoError> {
        let url = validate_url(url)?;
        Ok(media_info::fetch_info(&self.inner.info_runner, &url).await?)
    }

    /// Validates the request, records a `pending` job and starts the
    /// background download. Returns as soon as the job row exists.
    pub async fn submit(&self, request: DownloadRequest) -> Result<Submitted, SubmitError> {
        let url = validate_url(request.url.as_deref())?;
        let format: OutputFormat = request
            .format
            .as_deref()
            .ok_or(ValidationError::MissingFormat)?
            .parse()?;
        let quality = match request.quality.as_deref().map(str::trim) {
            Some(quality) if !quality.is_empty() => quality.to_string(),
            _ => self.inner.settings.get().await?.default_quality,
        };
        let custom_name = request
            .custom_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let platform = platform::detect(&url);

        let job = self
            .inner
            .jobs
            .create(NewJob {
                url,
                platform,
                format,
                quality,
                custom_name,
            })
            .await?;
        tracing::info!(job_id = %job.id, %platform, %format, quality = %job.quality, "download queued");

        let id = job.id.clone();
        self.spawn_supervised(id.clone(), run_job(self.inner.clone(), job));
        Ok(Submitted { id, platform })
    }

    /// Runs the job in its own task and turns panics or store errors into a
    /// failed row.
    fn spawn_supervised<F>(&self, id: String, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let guard = ActiveGuard::enter(self.inner.clone());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let outcome = tokio::spawn(work).await;
            let message = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(err)) => {
                    tracing::error!(job_id = %id, error = ?err, "download job aborted");
                    format!("Internal error: {err}")
                }
                Err(err) => {
                    tracing::error!(job_id = %id, error = %err, "download task panicked");
                    CRASHED_MESSAGE.to_string()
                }
            };
            if let Err(err) = inner.jobs.fail(&id, &message).await {
                tracing::error!(job_id = %id, error = ?err, "could not record job failure");
            }
        });
    }
}

async fn run_job(inner: Arc<ServiceInner>, job: DownloadJob) -> Result<()> {
    let id = job.id.as_str();

    let info = match media_info::fetch_info(&inner.info_runner, &job.url).await {
        Ok(info) => {
            inner
                .jobs
                .attach_metadata(id, &info.title, &info.thumbnail, info.duration)
                .await?;
            Some(info)
        }
        Err(err) => {
            tracing::warn!(job_id = %id, error = %err, "metadata lookup failed, downloading anyway");
            None
        }
    };

    inner.jobs.mark_downloading(id).await?;
    let output_dir = inner.settings.get().await?.download_dir();
    tracing::info!(job_id = %id, dir = %output_dir.display(), "download started");

    let options = DownloadOptions {
        url: job.url.clone(),
        format: job.format,
        quality: job.quality.clone(),
        custom_name: job.custom_name.clone(),
    };

    // One consumer applies progress in emission order.
    let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
    let store = inner.jobs.clone();
    let progress_id = id.to_string();
    let consumer = tokio::spawn(async move {
        while let Some(percent) = rx.recv().await {
            if let Err(err) = store.update_progress(&progress_id, percent).await {
                tracing::warn!(job_id = %progress_id, error = ?err, "progress update failed");
            }
        }
    });

    let result = download::download(&inner.download_runner, &options, &output_dir, |update| {
        let _ = tx.send(update.percent.round() as u8);
    })
    .await;
    drop(tx);
    consumer.await?;

    match result {
        Ok(file) => finish(&inner, id, file, info.as_ref()).await,
        Err(err) => {
            let message = failure_message(&err);
            tracing::warn!(job_id = %id, error = %err, "download failed");
            inner.jobs.fail(id, &message).await?;
            Ok(())
        }
    }
}

async fn finish(
    inner: &ServiceInner,
    id: &str,
    file: DownloadedFile,
    info: Option<&VideoInfo>,
) -> Result<()> {
    let size = match tokio::fs::metadata(&file.file_path).await {
        Ok(meta) => meta.len(),
        Err(err) => {
            tracing::warn!(job_id = %id, path = %file.file_path.display(), error = %err, "downloaded file missing");
            inner
                .jobs
                .fail(
                    id,
                    &format!("Downloaded file not found: {}", file.file_name),
                )
                .await?;
            return Ok(());
        }
    };

    let title = info
        .map(|info| info.title.clone())
        .unwrap_or_else(|| file_stem(&file.file_path, &file.file_name));
    let done = CompletedJob {
        file_path: file.file_path.to_string_lossy().into_owned(),
        file_size: format_file_size(size),
        title,
    };
    inner.jobs.complete(id, &done).await?;
    tracing::info!(job_id = %id, path = %done.file_path, size = %done.file_size, "download completed");
    Ok(())
}

fn file_stem(path: &Path, fallback: &str) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}
