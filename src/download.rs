//! Download orchestration on top of the tool runner.
//!
//! The interesting bits are the format-argument policy, the output template,
//! and [`ProgressParser`], which turns the tool's line-oriented output into
//! progress updates plus the path of the file that was finally written.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, ValidationError};
use crate::process::ToolRunner;

pub const PROGRESS_TEMPLATE: &str =
    "%(progress._percent_str)s|%(progress._speed_str)s|%(progress._eta_str)s";
const MAX_NAME_CHARS: usize = 100;
const FALLBACK_STEM: &str = "download";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Webm,
    M4a,
    Mp3,
    Audio,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::M4a => "m4a",
            Self::Mp3 => "mp3",
            Self::Audio => "audio",
        }
    }

    /// `mp3` and `audio` both mean "extract the audio track to mp3".
    pub fn is_audio_only(self) -> bool {
        matches!(self, Self::Mp3 | Self::Audio)
    }

    /// Extension used when the tool never tells us where it wrote the file.
    pub fn expected_extension(self) -> &'static str {
        match self {
            Self::Mp3 | Self::Audio => "mp3",
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::M4a => "m4a",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "webm" => Ok(Self::Webm),
            "m4a" => Ok(Self::M4a),
            "mp3" => Ok(Self::Mp3),
            "audio" => Ok(Self::Audio),
            "" => Err(ValidationError::MissingFormat),
            _ => Err(ValidationError::UnsupportedFormat(value.trim().to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested quality. Anything that is neither `best`/`highest` nor `<N>p`
/// (for example `audio`) falls back to the default selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Best,
    MaxHeight(u32),
    Default,
}

impl Quality {
    pub fn parse(value: &str) -> Self {
        let value = value.trim().to_ascii_lowercase();
        if value == "best" || value == "highest" {
            return Self::Best;
        }
        value
            .strip_suffix('p')
            .and_then(|height| height.parse::<u32>().ok())
            .filter(|height| *height > 0)
            .map(Self::MaxHeight)
            .unwrap_or(Self::Default)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub url: String,
    pub format: OutputFormat,
    pub quality: String,
    pub custom_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub file_path: PathBuf,
    pub file_name: String,
}

/// One parsed progress line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub percent: f64,
    pub speed: String,
    pub eta: String,
}

/// The tool's stream-selection expression for a format/quality pair.
pub fn format_selector(format: OutputFormat, quality: &str) -> String {
    if format.is_audio_only() {
        return "bestaudio/best".to_string();
    }
    match Quality::parse(quality) {
        Quality::Best | Quality::Default => "bestvideo+bestaudio/best".to_string(),
        Quality::MaxHeight(height) => {
            format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
        }
    }
}

/// Strips characters that are illegal or awkward in file names, collapses
/// whitespace and caps the length. Returns `None` when nothing usable is left.
pub fn sanitize_file_stem(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_start_matches('.').trim();
    let capped: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
    let capped = capped.trim_end().to_string();
    if capped.is_empty() { None } else { Some(capped) }
}

fn output_template(output_dir: &Path, custom_stem: Option<&str>) -> String {
    let file = match custom_stem {
        // `%` starts a field in the tool's template language.
        Some(stem) => format!("{}.%(ext)s", stem.replace('%', "%%")),
        None => "%(title)s.%(ext)s".to_string(),
    };
    output_dir.join(file).to_string_lossy().into_owned()
}

/// Full argument vector for a download run.
pub fn download_args(options: &DownloadOptions, output_dir: &Path) -> Vec<String> {
    let custom_stem = options.custom_name.as_deref().and_then(sanitize_file_stem);
    let mut args: Vec<String> = vec![
        "--no-warnings".into(),
        "--newline".into(),
        "--progress".into(),
        "--progress-template".into(),
        PROGRESS_TEMPLATE.into(),
        "-f".into(),
        format_selector(options.format, &options.quality),
        "-o".into(),
        output_template(output_dir, custom_stem.as_deref()),
    ];

    if options.format.is_audio_only() {
        args.extend(
            ["-x", "--audio-format", "mp3", "--audio-quality", "0"].map(String::from),
        );
    } else if options.format == OutputFormat::Mp4 {
        args.extend(["--merge-output-format", "mp4"].map(String::from));
    }

    args.push("--".into());
    args.push(options.url.clone());
    args
}

/// Parses `  55.5%|2.0MiB/s|00:10`. The percent is clamped into [0, 100].
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let mut parts = line.split('|');
    let percent_part = parts.next()?;
    let speed = parts.next()?.trim().to_string();
    let eta = parts.next()?.trim().to_string();
    let percent = percent_part.trim().strip_suffix('%')?.trim().parse::<f64>().ok()?;
    if percent.is_nan() {
        return None;
    }
    Some(ProgressUpdate {
        percent: percent.clamp(0.0, 100.0),
        speed,
        eta,
    })
}

/// Extracts a path from any of the markers the tool prints when it opens or
/// produces a file.
pub fn parse_destination(line: &str) -> Option<PathBuf> {
    if let Some((_, rest)) = line.split_once("Destination:") {
        let path = rest.trim();
        return (!path.is_empty()).then(|| PathBuf::from(path));
    }
    if line.contains("[Merger]")
        && let Some((_, rest)) = line.split_once("Merging formats into")
    {
        let path = rest.trim().trim_matches('"');
        return (!path.is_empty()).then(|| PathBuf::from(path));
    }
    if let Some(rest) = line.strip_prefix("[download] ")
        && let Some(path) = rest.trim_end().strip_suffix(" has already been downloaded")
    {
        return Some(PathBuf::from(path.trim()));
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    SeekingDestination,
    InProgress,
    Done,
}

/// Line-driven state machine over the tool's output.
///
/// `SeekingDestination` until a destination marker or a progress line shows
/// up, `InProgress` while percentages arrive, `Done` after a 100% line. A
/// later phase (second stream, audio extraction, merge) moves it back to
/// `InProgress`. The most recent destination always wins since
/// post-processors rewrite the final file.
#[derive(Debug)]
pub struct ProgressParser {
    state: ParserState,
    destination: Option<PathBuf>,
    last_progress_line: Option<String>,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::SeekingDestination,
            destination: None,
            last_progress_line: None,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// Feeds one stdout line; returns an update when it is a new progress line.
    pub fn feed_stdout(&mut self, line: &str) -> Option<ProgressUpdate> {
        if self.observe_destination(line) {
            return None;
        }
        let Some(update) = parse_progress_line(line) else {
            self.last_progress_line = None;
            return None;
        };
        let trimmed = line.trim();
        if self.last_progress_line.as_deref() == Some(trimmed) {
            return None;
        }
        self.last_progress_line = Some(trimmed.to_string());
        self.state = if update.percent >= 100.0 {
            ParserState::Done
        } else {
            ParserState::InProgress
        };
        Some(update)
    }

    /// Stderr never carries progress, only destination markers.
    pub fn feed_stderr(&mut self, line: &str) {
        self.observe_destination(line);
    }

    fn observe_destination(&mut self, line: &str) -> bool {
        let Some(path) = parse_destination(line) else {
            return false;
        };
        self.destination = Some(path);
        self.state = ParserState::InProgress;
        self.last_progress_line = None;
        true
    }
}

/// Maps a non-zero exit to a user-facing category using known stderr text.
pub fn classify_failure(code: Option<i32>, stderr: &str) -> DownloadError {
    const AUTH: &[&str] = &["Sign in to confirm", "Login required", "login required"];
    const UNAVAILABLE: &[&str] = &["Video unavailable", "Private video"];
    const NETWORK: &[&str] = &["HTTP Error", "Unable to download webpage"];

    let contains_any = |needles: &[&str]| needles.iter().any(|needle| stderr.contains(needle));
    if contains_any(AUTH) {
        DownloadError::AuthenticationRequired
    } else if contains_any(UNAVAILABLE) {
        DownloadError::Unavailable
    } else if contains_any(NETWORK) {
        DownloadError::Network
    } else {
        DownloadError::Failed { code }
    }
}

/// Downloads `options.url` into `output_dir`, reporting every new progress
/// line through `on_progress` in the order the tool printed them.
pub async fn download<F>(
    runner: &ToolRunner,
    options: &DownloadOptions,
    output_dir: &Path,
    mut on_progress: F,
) -> Result<DownloadedFile, DownloadError>
where
    F: FnMut(ProgressUpdate),
{
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(DownloadError::OutputDir)?;

    let args = download_args(options, output_dir);
    // Both callbacks need the parser; the lock is never contended.
    let parser = Mutex::new(ProgressParser::new());
    let exit = runner
        .run_streaming(
            &args,
            |line| {
                let update = parser.lock().feed_stdout(line);
                if let Some(update) = update {
                    on_progress(update);
                }
            },
            |line| parser.lock().feed_stderr(line),
        )
        .await?;

    if !exit.success() {
        return Err(classify_failure(exit.code, &exit.stderr));
    }

    let parser = parser.into_inner();
    let file_path = match parser.destination() {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => output_dir.join(path),
        None => output_dir.join(synthesized_name(options)),
    };
    let file_name = file_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| synthesized_name(options));
    Ok(DownloadedFile {
        file_path,
        file_name,
    })
}

fn synthesized_name(options: &DownloadOptions) -> String {
    let stem = options
        .custom_name
        .as_deref()
        .and_then(sanitize_file_stem)
        .unwrap_or_else(|| FALLBACK_STEM.to_string());
    format!("{stem}.{}", options.format.expected_extension())
}
