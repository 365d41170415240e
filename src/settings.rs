//! The singleton user preferences row.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use libsql::{Connection, params};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::download::OutputFormat;
use crate::error::ValidationError;

const SETTINGS_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub default_format: OutputFormat,
    pub default_quality: String,
    pub auto_rename: bool,
    pub download_path: String,
    pub dark_mode: bool,
}

impl Settings {
    /// Values used the first time the row is read.
    pub fn defaults(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_format: OutputFormat::Mp4,
            default_quality: "best".to_string(),
            auto_rename: true,
            download_path: download_dir.into().to_string_lossy().into_owned(),
            dark_mode: false,
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        PathBuf::from(&self.download_path)
    }
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub default_format: Option<String>,
    pub default_quality: Option<String>,
    pub auto_rename: Option<bool>,
    pub download_path: Option<String>,
    pub dark_mode: Option<bool>,
}

/// Validated form of [`SettingsPatch`].
#[derive(Debug)]
struct CheckedPatch {
    default_format: Option<OutputFormat>,
    default_quality: Option<String>,
    auto_rename: Option<bool>,
    download_path: Option<String>,
    dark_mode: Option<bool>,
}

impl SettingsPatch {
    fn check(self) -> Result<CheckedPatch, ValidationError> {
        let default_format = self
            .default_format
            .map(|value| value.parse::<OutputFormat>())
            .transpose()?;
        let default_quality = match self.default_quality {
            Some(value) if value.trim().is_empty() => {
                return Err(ValidationError::Blank {
                    field: "defaultQuality",
                });
            }
            other => other.map(|value| value.trim().to_string()),
        };
        let download_path = match self.download_path {
            Some(value) if value.trim().is_empty() => {
                return Err(ValidationError::Blank {
                    field: "downloadPath",
                });
            }
            other => other.map(|value| value.trim().to_string()),
        };
        Ok(CheckedPatch {
            default_format,
            default_quality,
            auto_rename: self.auto_rename,
            download_path,
            dark_mode: self.dark_mode,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Reads and writes the `settings` row. The last value read or written is
/// cached; the row is only touched through this store.
pub struct SettingsStore {
    conn: Connection,
    defaults: Settings,
    current: RwLock<Option<Settings>>,
}

impl SettingsStore {
    pub fn new(conn: Connection, defaults: Settings) -> Self {
        Self {
            conn,
            defaults,
            current: RwLock::new(None),
        }
    }

    /// Returns the stored settings, inserting the defaults on first access.
    pub async fn get(&self) -> Result<Settings> {
        let cached = self.current.read().clone();
        if let Some(cached) = cached {
            return Ok(cached);
        }
        self.ensure_row().await?;
        let settings = self.load().await?;
        // An update may have landed while loading; its value wins.
        let mut slot = self.current.write();
        Ok(slot.get_or_insert(settings).clone())
    }

    pub async fn update(&self, patch: SettingsPatch) -> Result<Settings, SettingsError> {
        let patch = patch.check()?;
        self.ensure_row().await?;
        self.conn
            .execute(
                r#"
                UPDATE settings SET
                    default_format = COALESCE(?2, default_format),
                    default_quality = COALESCE(?3, default_quality),
                    auto_rename = COALESCE(?4, auto_rename),
                    download_path = COALESCE(?5, download_path),
                    dark_mode = COALESCE(?6, dark_mode),
                    updated_at = ?7
                WHERE id = ?1
                "#,
                params![
                    SETTINGS_ID,
                    patch.default_format.map(OutputFormat::as_str),
                    patch.default_quality.as_deref(),
                    patch.auto_rename.map(i64::from),
                    patch.download_path.as_deref(),
                    patch.dark_mode.map(i64::from),
                    now(),
                ],
            )
            .await
            .context("updating settings")?;

        let settings = self.load().await?;
        *self.current.write() = Some(settings.clone());
        tracing::info!(?settings, "settings updated");
        Ok(settings)
    }

    async fn ensure_row(&self) -> Result<()> {
        let defaults = &self.defaults;
        self.conn
            .execute(
                r#"
                INSERT OR IGNORE INTO settings (
                    id, default_format, default_quality, auto_rename,
                    download_path, dark_mode, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    SETTINGS_ID,
                    defaults.default_format.as_str(),
                    defaults.default_quality.as_str(),
                    i64::from(defaults.auto_rename),
                    defaults.download_path.as_str(),
                    i64::from(defaults.dark_mode),
                    now(),
                ],
            )
            .await
            .context("inserting default settings")?;
        Ok(())
    }

    async fn load(&self) -> Result<Settings> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT default_format, default_quality, auto_rename, download_path, dark_mode
                FROM settings WHERE id = ?1
                "#,
                params![SETTINGS_ID],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| anyhow!("settings row missing"))?;

        let format: String = row.get(0)?;
        let auto_rename: i64 = row.get(2)?;
        let dark_mode: i64 = row.get(4)?;
        Ok(Settings {
            default_format: format
                .parse()
                .map_err(|err| anyhow!("stored default format {format:?} is invalid: {err}"))?,
            default_quality: row.get(1)?,
            auto_rename: auto_rename != 0,
            download_path: row.get(3)?,
            dark_mode: dark_mode != 0,
        })
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
