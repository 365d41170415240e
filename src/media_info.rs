//! Metadata lookups: `yt-dlp --dump-single-json` normalised into the stable
//! shape the API hands to clients.

use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::platform::{self, Platform};
use crate::process::ToolRunner;

pub const MAX_FORMATS: usize = 20;
pub const MAX_DESCRIPTION_CHARS: usize = 500;
const UNKNOWN_TITLE: &str = "Unknown Title";
const UNKNOWN_UPLOADER: &str = "Unknown";
const SEGMENTED_PROTOCOL: &str = "http_dash_segments";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: String,
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    pub kind: MediaKind,
}

impl FormatInfo {
    /// Human label used by the picker, e.g. `720p (1280x720)`.
    pub fn label(&self) -> String {
        match &self.resolution {
            Some(resolution) => format!("{} ({resolution})", self.quality),
            None => self.quality.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: String,
    pub thumbnail: String,
    pub duration: u64,
    pub uploader: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub platform: Platform,
    pub formats: Vec<FormatInfo>,
}

/// Subset of the tool's JSON dump. Everything is optional because extractors
/// differ wildly in what they fill in.
#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<RawThumbnail>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    description: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    format_note: Option<String>,
    protocol: Option<String>,
    width: Option<u64>,
    height: Option<u64>,
    filesize: Option<u64>,
    vcodec: Option<String>,
}

pub fn info_args(url: &str) -> Vec<String> {
    [
        "--dump-single-json",
        "--no-playlist",
        "--skip-download",
        "--no-warnings",
        "--",
        url,
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Runs the tool in metadata mode for a single item (no playlist expansion).
pub async fn fetch_info(runner: &ToolRunner, url: &str) -> Result<VideoInfo, ToolError> {
    let raw: RawInfo = runner.run_json(&info_args(url)).await?;
    Ok(normalize(raw, platform::detect(url)))
}

fn normalize(raw: RawInfo, platform: Platform) -> VideoInfo {
    let title = non_empty(raw.title).unwrap_or_else(|| UNKNOWN_TITLE.to_string());
    let thumbnail = non_empty(raw.thumbnail)
        .or_else(|| raw.thumbnails.into_iter().find_map(|thumb| non_empty(thumb.url)))
        .unwrap_or_default();
    let duration = raw
        .duration
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|value| value.round() as u64)
        .unwrap_or(0);
    let uploader = non_empty(raw.uploader)
        .or_else(|| non_empty(raw.channel))
        .unwrap_or_else(|| UNKNOWN_UPLOADER.to_string());
    let description = raw
        .description
        .map(|text| truncate_chars(&text, MAX_DESCRIPTION_CHARS));

    let formats = raw
        .formats
        .into_iter()
        .filter_map(normalize_format)
        .take(MAX_FORMATS)
        .collect();

    VideoInfo {
        title,
        thumbnail,
        duration,
        uploader,
        description,
        platform,
        formats,
    }
}

fn normalize_format(raw: RawFormat) -> Option<FormatInfo> {
    if raw.protocol.as_deref() == Some(SEGMENTED_PROTOCOL) {
        return None;
    }
    let format_id = non_empty(raw.format_id)?;
    let ext = non_empty(raw.ext)?;
    let resolution = match (raw.width, raw.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => {
            Some(format!("{width}x{height}"))
        }
        _ => None,
    };
    let kind = match raw.vcodec.as_deref() {
        Some(codec) if codec != "none" => MediaKind::Video,
        _ => MediaKind::Audio,
    };
    Some(FormatInfo {
        format_id,
        ext,
        quality: non_empty(raw.format_note).unwrap_or_else(|| "unknown".to_string()),
        resolution,
        filesize: raw.filesize,
        kind,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::script_runner;
    use serde_json::json;
    use tempfile::tempdir;

    fn raw_from(value: serde_json::Value) -> RawInfo {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn normalize_applies_fallbacks() {
        let info = normalize(
            raw_from(json!({
                "thumbnails": [{"id": "0"}, {"url": "https://img/1.jpg"}],
                "channel": "Some Channel"
            })),
            Platform::Vimeo,
        );
        assert_eq!(info.title, "Unknown Title");
        assert_eq!(info.thumbnail, "https://img/1.jpg");
        assert_eq!(info.duration, 0);
        assert_eq!(info.uploader, "Some Channel");
        assert!(info.description.is_none());
        assert_eq!(info.platform, Platform::Vimeo);
        assert!(info.formats.is_empty());

        let bare = normalize(RawInfo::default(), Platform::Unknown);
        assert_eq!(bare.thumbnail, "");
        assert_eq!(bare.uploader, "Unknown");
    }

    #[test]
    fn normalize_rounds_fractional_duration_and_truncates_description() {
        let long = "é".repeat(MAX_DESCRIPTION_CHARS + 20);
        let info = normalize(
            raw_from(json!({
                "title": "Clip",
                "uploader": "Uploader",
                "channel": "ignored",
                "duration": 61.6,
                "description": long,
            })),
            Platform::Youtube,
        );
        assert_eq!(info.duration, 62);
        assert_eq!(info.uploader, "Uploader");
        assert_eq!(
            info.description.as_deref().map(|text| text.chars().count()),
            Some(MAX_DESCRIPTION_CHARS)
        );
    }

    #[test]
    fn formats_are_filtered_classified_and_capped() {
        let mut formats = vec![
            json!({"format_id": "dash", "ext": "mp4", "protocol": "http_dash_segments", "vcodec": "avc1"}),
            json!({"ext": "mp4"}),
            json!({"format_id": "noext"}),
            json!({"format_id": "140", "ext": "m4a", "format_note": "medium", "vcodec": "none", "acodec": "mp4a"}),
            json!({"format_id": "137", "ext": "mp4", "format_note": "1080p", "width": 1920, "height": 1080, "vcodec": "avc1", "filesize": 1024}),
        ];
        for index in 0..30 {
            formats.push(json!({"format_id": format!("x{index}"), "ext": "webm"}));
        }
        let info = normalize(raw_from(json!({ "formats": formats })), Platform::Youtube);

        assert_eq!(info.formats.len(), MAX_FORMATS);
        let audio = &info.formats[0];
        assert_eq!(audio.format_id, "140");
        assert_eq!(audio.kind, MediaKind::Audio);
        assert_eq!(audio.label(), "medium");

        let video = &info.formats[1];
        assert_eq!(video.kind, MediaKind::Video);
        assert_eq!(video.resolution.as_deref(), Some("1920x1080"));
        assert_eq!(video.label(), "1080p (1920x1080)");
        assert_eq!(video.filesize, Some(1024));

        let unnamed = &info.formats[2];
        assert_eq!(unnamed.quality, "unknown");
        assert_eq!(unnamed.kind, MediaKind::Audio);
    }

    #[test]
    fn info_args_request_single_item_dump() {
        let args = info_args("https://youtu.be/abc");
        assert!(args.contains(&"--dump-single-json".to_string()));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
        assert_eq!(args[args.len() - 2], "--");
    }

    #[tokio::test]
    async fn fetch_info_runs_tool_and_detects_platform() {
        let dir = tempdir().unwrap();
        let runner = script_runner(
            dir.path(),
            "yt-dlp",
            r#"case "$*" in
  *--dump-single-json*--no-playlist*) ;;
  *) echo "unexpected args: $*" >&2; exit 2 ;;
esac
cat <<'JSON'
{"title": "Stub Clip", "thumbnail": "https://img/t.jpg", "duration": 42, "uploader": "Stub", "formats": [{"format_id": "18", "ext": "mp4", "format_note": "360p", "width": 640, "height": 360, "vcodec": "avc1"}]}
JSON"#,
        );
        let info = fetch_info(&runner, "https://www.youtube.com/watch?v=abc")
            .await
            .unwrap();
        assert_eq!(info.title, "Stub Clip");
        assert_eq!(info.duration, 42);
        assert_eq!(info.platform, Platform::Youtube);
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].label(), "360p (640x360)");
    }

    #[tokio::test]
    async fn fetch_info_surfaces_tool_failure() {
        let dir = tempdir().unwrap();
        let runner = script_runner(
            dir.path(),
            "yt-dlp",
            "echo 'ERROR: Unsupported URL: https://example.org' >&2\nexit 1",
        );
        let err = fetch_info(&runner, "https://example.org").await.unwrap_err();
        assert!(matches!(err, ToolError::ExternalTool { code: Some(1), .. }));
        assert!(err.to_string().contains("Unsupported URL"));
    }
}
