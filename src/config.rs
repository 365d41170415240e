use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::process::{DEFAULT_PROGRAM, ToolRunner};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DATABASE_FILE: &str = "mediadrop.db";
pub const DOWNLOADS_SUBDIR: &str = "downloads";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 6 * 60 * 60;
pub const DEFAULT_INFO_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub download_dir: PathBuf,
    pub www_root: Option<PathBuf>,
    pub host: IpAddr,
    pub port: u16,
    /// Command line for the extraction tool, e.g. `python3 -m yt_dlp`.
    pub ytdlp: String,
    pub download_timeout: Option<Duration>,
    pub info_timeout: Option<Duration>,
    pub log_level: Option<String>,
}

impl RuntimeConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn download_runner(&self) -> ToolRunner {
        ToolRunner::from_command_line(&self.ytdlp).with_timeout(self.download_timeout)
    }

    pub fn info_runner(&self) -> ToolRunner {
        ToolRunner::from_command_line(&self.ytdlp).with_timeout(self.info_timeout)
    }
}

/// Values given on the command line; they win over the environment and the
/// env file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_dir: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_dir = overrides
        .data_dir
        .or_else(|| lookup("MEDIADROP_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let download_dir = overrides
        .download_dir
        .or_else(|| lookup("MEDIADROP_DOWNLOAD_DIR").map(PathBuf::from))
        .unwrap_or_else(|| data_dir.join(DOWNLOADS_SUBDIR));
    let www_root = overrides
        .www_root
        .or_else(|| lookup("MEDIADROP_WWW_ROOT").map(PathBuf::from));

    let host_raw = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("MEDIADROP_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let host = host_raw
        .parse::<IpAddr>()
        .with_context(|| format!("expected a valid IPv4 or IPv6 address, got {host_raw:?}"))?;

    let port = overrides
        .port
        .or_else(|| lookup("MEDIADROP_PORT").and_then(|value| value.parse::<u16>().ok()))
        .or_else(|| lookup("PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);

    let ytdlp = lookup("MEDIADROP_YTDLP").unwrap_or_else(|| DEFAULT_PROGRAM.to_string());
    let download_timeout = timeout_value(
        lookup("MEDIADROP_DOWNLOAD_TIMEOUT_SECS"),
        DEFAULT_DOWNLOAD_TIMEOUT_SECS,
    );
    let info_timeout = timeout_value(
        lookup("MEDIADROP_INFO_TIMEOUT_SECS"),
        DEFAULT_INFO_TIMEOUT_SECS,
    );

    Ok(RuntimeConfig {
        data_dir,
        download_dir,
        www_root,
        host,
        port,
        ytdlp,
        download_timeout,
        info_timeout,
        log_level: lookup("MEDIADROP_LOG"),
    })
}

/// `0` disables the timeout; garbage falls back to the default.
fn timeout_value(raw: Option<String>, default_secs: u64) -> Option<Duration> {
    let secs = raw
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default_secs);
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None).unwrap()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = build_runtime_config(&HashMap::new(), |_| None).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.download_dir, PathBuf::from("data/downloads"));
        assert_eq!(config.database_path(), PathBuf::from("data/mediadrop.db"));
        assert!(config.www_root.is_none());
        assert_eq!(config.host.to_string(), DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.ytdlp, "yt-dlp");
        assert_eq!(
            config.download_timeout,
            Some(Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS))
        );
        assert_eq!(config.info_timeout, Some(Duration::from_secs(120)));
        assert!(config.log_level.is_none());
    }

    #[test]
    fn download_dir_follows_data_dir() {
        let config = config_from("MEDIADROP_DATA_DIR=\"/srv/md\"\n");
        assert_eq!(config.download_dir, PathBuf::from("/srv/md/downloads"));
    }

    #[test]
    fn reads_values_from_file() {
        let config = config_from(
            "MEDIADROP_DOWNLOAD_DIR=/dl\nMEDIADROP_WWW_ROOT='/www'\nMEDIADROP_HOST=0.0.0.0\n\
             MEDIADROP_PORT=\"4242\"\nMEDIADROP_YTDLP=\"python3 -m yt_dlp\"\n\
             MEDIADROP_DOWNLOAD_TIMEOUT_SECS=0\nMEDIADROP_INFO_TIMEOUT_SECS=30\nMEDIADROP_LOG=debug\n",
        );
        assert_eq!(config.download_dir, PathBuf::from("/dl"));
        assert_eq!(config.www_root, Some(PathBuf::from("/www")));
        assert_eq!(config.host.to_string(), "0.0.0.0");
        assert_eq!(config.port, 4242);
        assert_eq!(config.ytdlp, "python3 -m yt_dlp");
        assert_eq!(config.download_timeout, None);
        assert_eq!(config.info_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.log_level.as_deref(), Some("debug"));

        let runner = config.info_runner();
        assert_eq!(runner.program_name(), "python3");
        assert_eq!(runner.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.download_runner().timeout(), None);
    }

    #[test]
    fn generic_port_is_a_fallback() {
        let config = config_from("PORT=9000\n");
        assert_eq!(config.port, 9000);
        let config = config_from("PORT=9000\nMEDIADROP_PORT=9001\n");
        assert_eq!(config.port, 9001);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config =
            config_from("MEDIADROP_PORT=\"nope\"\nMEDIADROP_DOWNLOAD_TIMEOUT_SECS=soon\n");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(
            config.download_timeout,
            Some(Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS))
        );
    }

    #[test]
    fn invalid_host_is_an_error() {
        let vars = read_env_file(make_config("MEDIADROP_HOST=localhost-ish\n").path()).unwrap();
        assert!(build_runtime_config(&vars, |_| None).is_err());
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("MEDIADROP_DATA_DIR=\"/file\"\n").path()).unwrap();
        let config = build_runtime_config(&vars, |key| {
            if key == "MEDIADROP_DATA_DIR" {
                Some("/env".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/env"));
    }

    #[test]
    fn blank_file_values_count_as_unset() {
        let config = config_from("MEDIADROP_YTDLP=\"\"\nMEDIADROP_HOST=\"  \"\n");
        assert_eq!(config.ytdlp, "yt-dlp");
        assert_eq!(config.host.to_string(), DEFAULT_HOST);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export MEDIADROP_DATA_DIR="/media"
            MEDIADROP_WWW_ROOT='/www'
            MEDIADROP_HOST =  "0.0.0.0"
            MEDIADROP_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("MEDIADROP_DATA_DIR").unwrap(), "/media");
        assert_eq!(vars.get("MEDIADROP_WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("MEDIADROP_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("MEDIADROP_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("MEDIADROP_DATA_DIR".to_string(), "/file-data".to_string());
        vars.insert("MEDIADROP_WWW_ROOT".to_string(), "/file-www".to_string());
        vars.insert("MEDIADROP_HOST".to_string(), "10.0.0.1".to_string());
        vars.insert("MEDIADROP_PORT".to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            data_dir: Some(PathBuf::from("/override-data")),
            download_dir: None,
            www_root: None,
            host: Some("::1".into()),
            port: Some(9000),
            env_path: None,
        };

        let config = build_runtime_config_with_overrides(
            &vars,
            |key| {
                if key == "MEDIADROP_WWW_ROOT" {
                    Some("/env-www".to_string())
                } else if key == "MEDIADROP_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/override-data"));
        assert_eq!(config.download_dir, PathBuf::from("/override-data/downloads"));
        assert_eq!(config.www_root, Some(PathBuf::from("/env-www")));
        assert_eq!(config.port, 9000);
        assert_eq!(config.host.to_string(), "::1");
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let config = build_runtime_config_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.host.to_string(), DEFAULT_HOST);
    }

    #[test]
    fn resolve_reads_explicit_env_file() {
        let cfg = make_config("MEDIADROP_DOWNLOAD_DIR=/from-file\n");
        let config = resolve_runtime_config(RuntimeOverrides {
            env_path: Some(cfg.path().to_path_buf()),
            download_dir: Some(PathBuf::from("/from-cli")),
            ..RuntimeOverrides::default()
        })
        .unwrap();
        assert_eq!(config.download_dir, PathBuf::from("/from-cli"));
    }
}
