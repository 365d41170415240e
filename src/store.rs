//! libsql persistence for download jobs.
//!
//! One row per job in `downloads`. Every mutation is keyed by id and guarded
//! by the row's status so that terminal jobs are never rewritten and progress
//! only ever moves forward while a download runs.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};

use crate::download::OutputFormat;
use crate::platform::Platform;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;
const INTERRUPTED_MESSAGE: &str = "Interrupted by a server restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A persisted download job, as exposed to the polling API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: String,
    pub url: String,
    pub platform: Platform,
    pub format: OutputFormat,
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<u64>,
    pub file_path: Option<String>,
    pub file_size: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a download request is accepted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub url: String,
    pub platform: Platform,
    pub format: OutputFormat,
    pub quality: String,
    pub custom_name: Option<String>,
}

/// Terminal data written when a download succeeds.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub file_path: String,
    pub file_size: String,
    pub title: String,
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parsing stored timestamp {raw}"))?
        .with_timezone(&Utc))
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            platform TEXT NOT NULL,
            format TEXT NOT NULL,
            quality TEXT NOT NULL,
            custom_name TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            progress INTEGER NOT NULL DEFAULT 0,
            title TEXT,
            thumbnail TEXT,
            duration INTEGER,
            file_path TEXT,
            file_size TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_downloads_created_at ON downloads(created_at);

        CREATE TABLE IF NOT EXISTS settings (
            id TEXT PRIMARY KEY,
            default_format TEXT NOT NULL,
            default_quality TEXT NOT NULL,
            auto_rename INTEGER NOT NULL DEFAULT 1,
            download_path TEXT NOT NULL,
            dark_mode INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .await?;
    Ok(())
}

/// Opens (and if necessary creates) the database file and provisions the
/// schema. The returned connection is cheap to clone and shared by the stores.
pub async fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }

    let db = Builder::new_local(path)
        .build()
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
    let conn = db.connect()?;
    configure_connection(&conn).await?;
    ensure_schema(&conn).await?;
    Ok(conn)
}

const JOB_COLUMNS: &str = r#"
    id, url, platform, format, quality, custom_name, status, progress,
    title, thumbnail, duration, file_path, file_size, error,
    created_at, updated_at
"#;

// Mutations only ever touch rows that have not reached a terminal state.
const ACTIVE: &str = "status IN ('pending', 'downloading')";

#[derive(Clone)]
pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn create(&self, job: NewJob) -> Result<DownloadJob> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = timestamp(Utc::now());
        self.conn
            .execute(
                r#"
                INSERT INTO downloads (
                    id, url, platform, format, quality, custom_name,
                    status, progress, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?7)
                "#,
                params![
                    id.as_str(),
                    job.url.as_str(),
                    job.platform.as_str(),
                    job.format.as_str(),
                    job.quality.as_str(),
                    job.custom_name.as_deref(),
                    now.as_str(),
                ],
            )
            .await
            .context("inserting download job")?;

        self.get(&id)
            .await?
            .ok_or_else(|| anyhow!("download job {id} vanished after insert"))
    }

    pub async fn get(&self, id: &str) -> Result<Option<DownloadJob>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM downloads WHERE id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent jobs first.
    pub async fn list(&self, limit: u32, offset: u32) -> Result<Vec<DownloadJob>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut rows = self
            .conn
            .query(
                &format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM downloads
                    ORDER BY created_at DESC, rowid DESC
                    LIMIT ?1 OFFSET ?2
                    "#
                ),
                params![i64::from(limit), i64::from(offset)],
            )
            .await?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    pub async fn count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM downloads", params![])
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        let count: i64 = row.get(0)?;
        Ok(count.max(0) as u64)
    }

    /// Copies resolved metadata onto a job that is still running.
    pub async fn attach_metadata(
        &self,
        id: &str,
        title: &str,
        thumbnail: &str,
        duration: u64,
    ) -> Result<bool> {
        let thumbnail = (!thumbnail.is_empty()).then_some(thumbnail);
        let changed = self
            .conn
            .execute(
                &format!(
                    r#"
                    UPDATE downloads
                    SET title = ?2, thumbnail = ?3, duration = ?4, updated_at = ?5
                    WHERE id = ?1 AND {ACTIVE}
                    "#
                ),
                params![
                    id,
                    title,
                    thumbnail,
                    duration as i64,
                    timestamp(Utc::now())
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    pub async fn mark_downloading(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE downloads SET status = 'downloading', updated_at = ?2
                WHERE id = ?1 AND status = 'pending'
                "#,
                params![id, timestamp(Utc::now())],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Raises the stored progress. Lower values (a later stream restarting at
    /// 0%) are ignored so the percentage never goes backwards.
    pub async fn update_progress(&self, id: &str, percent: u8) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE downloads SET progress = ?2, updated_at = ?3
                WHERE id = ?1 AND status = 'downloading' AND progress < ?2
                "#,
                params![id, i64::from(percent.min(100)), timestamp(Utc::now())],
            )
            .await?;
        Ok(changed > 0)
    }

    pub async fn complete(&self, id: &str, done: &CompletedJob) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    r#"
                    UPDATE downloads
                    SET status = 'completed', progress = 100, file_path = ?2,
                        file_size = ?3, title = ?4, error = NULL, updated_at = ?5
                    WHERE id = ?1 AND {ACTIVE}
                    "#
                ),
                params![
                    id,
                    done.file_path.as_str(),
                    done.file_size.as_str(),
                    done.title.as_str(),
                    timestamp(Utc::now())
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    pub async fn fail(&self, id: &str, message: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    r#"
                    UPDATE downloads SET status = 'failed', error = ?2, updated_at = ?3
                    WHERE id = ?1 AND {ACTIVE}
                    "#
                ),
                params![id, message, timestamp(Utc::now())],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Returns whether a row was removed; unknown ids are not an error.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM downloads WHERE id = ?1", params![id])
            .await?;
        Ok(changed > 0)
    }

    /// Jobs that were still running when the previous process died can never
    /// finish; mark them failed at startup.
    pub async fn fail_interrupted(&self) -> Result<u64> {
        let changed = self
            .conn
            .execute(
                &format!(
                    r#"
                    UPDATE downloads SET status = 'failed', error = ?1, updated_at = ?2
                    WHERE {ACTIVE}
                    "#
                ),
                params![INTERRUPTED_MESSAGE, timestamp(Utc::now())],
            )
            .await?;
        Ok(changed)
    }
}

/// Column order must match `JOB_COLUMNS`.
fn row_to_job(row: &Row) -> Result<DownloadJob> {
    let platform: String = row.get(2)?;
    let format: String = row.get(3)?;
    let status: String = row.get(6)?;
    let progress: i64 = row.get(7)?;
    let duration: Option<i64> = row.get(10)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;

    Ok(DownloadJob {
        id: row.get(0)?,
        url: row.get(1)?,
        platform: Platform::from_tag(&platform),
        format: format
            .parse()
            .map_err(|err| anyhow!("stored format {format:?} is invalid: {err}"))?,
        quality: row.get(4)?,
        custom_name: row.get(5)?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| anyhow!("stored status {status:?} is invalid"))?,
        progress: progress.clamp(0, 100) as u8,
        title: row.get(8)?,
        thumbnail: row.get(9)?,
        duration: duration.map(|value| value.max(0) as u64),
        file_path: row.get(11)?,
        file_size: row.get(12)?,
        error: row.get(13)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::{new_job, temp_database};
    use super::*;

    fn completed(title: &str) -> CompletedJob {
        CompletedJob {
            file_path: format!("/dl/{title}.mp4"),
            file_size: "1.00 MB".into(),
            title: title.into(),
        }
    }

    #[tokio::test]
    async fn open_creates_schema_in_wal_mode() -> Result<()> {
        let (_dir, conn) = temp_database().await;
        let mut rows = conn.query("PRAGMA journal_mode", params![]).await?;
        let journal: String = rows.next().await?.context("missing row")?.get(0)?;
        assert_eq!(journal.to_lowercase(), "wal");

        for table in ["downloads", "settings"] {
            let mut rows = conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                )
                .await?;
            let exists: Option<String> = rows
                .next()
                .await?
                .map(|row| row.get::<String>(0))
                .transpose()?;
            assert_eq!(exists.as_deref(), Some(table));
        }
        Ok(())
    }

    #[tokio::test]
    async fn create_starts_pending() -> Result<()> {
        let (_dir, conn) = temp_database().await;
        let store = JobStore::new(conn);
        let job = store.create(new_job("https://youtu.be/abc")).await?;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.platform, Platform::Youtube);
        assert!(job.title.is_none());
        assert_eq!(store.get(&job.id).await?, Some(job));
        Ok(())
    }

    #[tokio::test]
    async fn progress_only_moves_forward_while_downloading() -> Result<()> {
        let (_dir, conn) = temp_database().await;
        let store = JobStore::new(conn);
        let job = store.create(new_job("https://vimeo.com/1")).await?;

        // Not downloading yet.
        assert!(!store.update_progress(&job.id, 10).await?);
        assert!(store.mark_downloading(&job.id).await?);
        assert!(store.update_progress(&job.id, 40).await?);
        assert!(!store.update_progress(&job.id, 5).await?);
        assert!(store.update_progress(&job.id, 200).await?);

        let job = store.get(&job.id).await?.unwrap();
        assert_eq!(job.status, JobStatus::Downloading);
        assert_eq!(job.progress, 100);
        Ok(())
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() -> Result<()> {
        let (_dir, conn) = temp_database().await;
        let store = JobStore::new(conn);
        let job = store.create(new_job("https://youtu.be/abc")).await?;
        store.mark_downloading(&job.id).await?;
        store.update_progress(&job.id, 30).await?;
        assert!(store.complete(&job.id, &completed("Clip")).await?);

        let first = store.get(&job.id).await?.unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(first.progress, 100);
        assert_eq!(first.file_path.as_deref(), Some("/dl/Clip.mp4"));

        assert!(!store.fail(&job.id, "late failure").await?);
        assert!(!store.update_progress(&job.id, 50).await?);
        assert!(!store.attach_metadata(&job.id, "Other", "", 1).await?);
        assert!(!store.complete(&job.id, &completed("Again")).await?);
        assert!(!store.mark_downloading(&job.id).await?);

        let second = store.get(&job.id).await?.unwrap();
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn fail_records_error() -> Result<()> {
        let (_dir, conn) = temp_database().await;
        let store = JobStore::new(conn);
        let job = store.create(new_job("https://youtu.be/abc")).await?;
        assert!(store.fail(&job.id, "Video is unavailable or private").await?);
        let job = store.get(&job.id).await?.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Video is unavailable or private"));
        Ok(())
    }

    #[tokio::test]
    async fn attach_metadata_stores_fields() -> Result<()> {
        let (_dir, conn) = temp_database().await;
        let store = JobStore::new(conn);
        let job = store.create(new_job("https://youtu.be/abc")).await?;
        assert!(store.attach_metadata(&job.id, "Title", "", 90).await?);
        let job = store.get(&job.id).await?.unwrap();
        assert_eq!(job.title.as_deref(), Some("Title"));
        assert_eq!(job.thumbnail, None);
        assert_eq!(job.duration, Some(90));
        Ok(())
    }

    #[tokio::test]
    async fn delete_unknown_is_noop() -> Result<()> {
        let (_dir, conn) = temp_database().await;
        let store = JobStore::new(conn);
        let keep = store.create(new_job("https://youtu.be/keep")).await?;
        assert!(!store.delete("does-not-exist").await?);
        assert_eq!(store.count().await?, 1);
        assert!(store.get(&keep.id).await?.is_some());

        assert!(store.delete(&keep.id).await?);
        assert!(!store.delete(&keep.id).await?);
        assert_eq!(store.count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn list_returns_newest_first_with_paging() -> Result<()> {
        let (_dir, conn) = temp_database().await;
        let store = JobStore::new(conn);
        let mut ids = Vec::new();
        for index in 0..5 {
            let job = store
                .create(new_job(&format!("https://vimeo.com/{index}")))
                .await?;
            ids.push(job.id);
        }

        let page = store.list(2, 0).await?;
        assert_eq!(
            page.iter().map(|job| job.id.as_str()).collect::<Vec<_>>(),
            vec![ids[4].as_str(), ids[3].as_str()]
        );
        let rest = store.list(10, 2).await?;
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[2].id, ids[0]);
        assert_eq!(store.count().await?, 5);
        Ok(())
    }

    #[tokio::test]
    async fn fail_interrupted_only_touches_active_jobs() -> Result<()> {
        let (_dir, conn) = temp_database().await;
        let store = JobStore::new(conn);
        let pending = store.create(new_job("https://youtu.be/a")).await?;
        let running = store.create(new_job("https://youtu.be/b")).await?;
        let done = store.create(new_job("https://youtu.be/c")).await?;
        store.mark_downloading(&running.id).await?;
        store.complete(&done.id, &completed("Done")).await?;

        assert_eq!(store.fail_interrupted().await?, 2);
        for id in [&pending.id, &running.id] {
            let job = store.get(id).await?.unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        }
        assert_eq!(
            store.get(&done.id).await?.unwrap().status,
            JobStatus::Completed
        );
        Ok(())
    }
}
