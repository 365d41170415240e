#![forbid(unsafe_code)]

//! Command-line access to the metadata and download pipelines without the
//! HTTP server or the job database.

use std::{
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mediadrop::config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config};
use mediadrop::download::{self, DownloadOptions, OutputFormat, ProgressUpdate};
use mediadrop::jobs::validate_url;
use mediadrop::logging;
use mediadrop::media_info;

#[derive(Debug, Parser)]
#[command(name = "fetch_media", about = "Inspect or download media through yt-dlp")]
struct Cli {
    /// Env file to read instead of `./.env`.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print normalised metadata as JSON.
    Info { url: String },
    /// Download one item and print the final path.
    Download {
        url: String,
        #[arg(long, default_value = "mp4")]
        format: String,
        #[arg(long, default_value = "best")]
        quality: String,
        /// Base file name (without extension).
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_runtime_config(RuntimeOverrides {
        env_path: cli.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;
    logging::init(config.log_level.as_deref().or(Some("warn")));

    match cli.command {
        Command::Info { url } => print_info(&config, &url).await,
        Command::Download {
            url,
            format,
            quality,
            name,
            output_dir,
        } => {
            let options = DownloadOptions {
                url: validate_url(Some(&url))?,
                format: format.parse::<OutputFormat>()?,
                quality,
                custom_name: name,
            };
            let output_dir = output_dir.unwrap_or_else(|| config.download_dir.clone());
            run_download(&config, &options, output_dir).await
        }
    }
}

async fn print_info(config: &RuntimeConfig, url: &str) -> Result<()> {
    let url = validate_url(Some(url))?;
    let info = media_info::fetch_info(&config.info_runner(), &url)
        .await
        .with_context(|| format!("fetching metadata for {url}"))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn run_download(
    config: &RuntimeConfig,
    options: &DownloadOptions,
    output_dir: PathBuf,
) -> Result<()> {
    let file = download::download(
        &config.download_runner(),
        options,
        &output_dir,
        print_progress,
    )
    .await
    .with_context(|| format!("downloading {}", options.url))?;
    eprintln!();
    println!("{}", file.file_path.display());
    Ok(())
}

fn print_progress(update: ProgressUpdate) {
    let mut stderr = io::stderr().lock();
    let _ = write!(stderr, "\r{}", progress_line(&update));
    let _ = stderr.flush();
}

fn progress_line(update: &ProgressUpdate) -> String {
    format!(
        "{:>5.1}%  {:>12}  ETA {}",
        update.percent, update.speed, update.eta
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_download_subcommand() {
        let cli = Cli::try_parse_from([
            "fetch_media",
            "download",
            "https://youtu.be/abc",
            "--format",
            "mp3",
            "--name",
            "song",
            "--output-dir",
            "/tmp/out",
        ])
        .unwrap();
        match cli.command {
            Command::Download {
                url,
                format,
                quality,
                name,
                output_dir,
            } => {
                assert_eq!(url, "https://youtu.be/abc");
                assert_eq!(format, "mp3");
                assert_eq!(quality, "best");
                assert_eq!(name.as_deref(), Some("song"));
                assert_eq!(output_dir, Some(PathBuf::from("/tmp/out")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn info_requires_url() {
        assert!(Cli::try_parse_from(["fetch_media", "info"]).is_err());
    }

    #[test]
    fn progress_line_is_padded() {
        let line = progress_line(&ProgressUpdate {
            percent: 5.0,
            speed: "1.2MiB/s".into(),
            eta: "00:30".into(),
        });
        assert_eq!(line, "  5.0%      1.2MiB/s  ETA 00:30");
    }
}
