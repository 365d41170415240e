use std::time::Duration;
use thiserror::Error;

/// Request problems caught before a job row or a process exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("URL is required")]
    MissingUrl,
    #[error("Invalid URL format")]
    InvalidUrl,
    #[error("Format is required")]
    MissingFormat,
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("{field} must not be empty")]
    Blank { field: &'static str },
}

/// Failures of a single external tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    ExternalTool {
        code: Option<i32>,
        stderr: String,
        message: String,
    },

    #[error("could not parse tool output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{program} timed out after {}s", .after.as_secs())]
    TimedOut { program: String, after: Duration },

    #[error("io error while talking to {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub(crate) fn external(program: &str, code: Option<i32>, stderr: String) -> Self {
        let trimmed = stderr.trim();
        let message = if trimmed.is_empty() {
            match code {
                Some(code) => format!("{program} exited with code {code}"),
                None => format!("{program} was terminated by a signal"),
            }
        } else {
            trimmed.to_string()
        };
        Self::ExternalTool {
            code,
            stderr,
            message,
        }
    }
}

/// Download failures, with non-zero exits classified from captured stderr.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("This media requires authentication. Try a different video or platform.")]
    AuthenticationRequired,

    #[error("Video is unavailable or private")]
    Unavailable,

    #[error("Network error. Please try again.")]
    Network,

    #[error("Download failed with code {}", .code.map(|code| code.to_string()).unwrap_or_else(|| "unknown".into()))]
    Failed { code: Option<i32> },

    #[error("{0}")]
    Tool(#[from] ToolError),

    #[error("could not prepare download directory: {0}")]
    OutputDir(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_error_prefers_stderr_text() {
        let err = ToolError::external("yt-dlp", Some(1), "ERROR: boom\n".into());
        assert_eq!(err.to_string(), "ERROR: boom");
    }

    #[test]
    fn external_error_falls_back_to_generic_message() {
        let err = ToolError::external("yt-dlp", Some(2), "  \n".into());
        assert_eq!(err.to_string(), "yt-dlp exited with code 2");
        let err = ToolError::external("yt-dlp", None, String::new());
        assert_eq!(err.to_string(), "yt-dlp was terminated by a signal");
    }

    #[test]
    fn download_failed_message_includes_code() {
        assert_eq!(
            DownloadError::Failed { code: Some(3) }.to_string(),
            "Download failed with code 3"
        );
        assert_eq!(
            DownloadError::Failed { code: None }.to_string(),
            "Download failed with code unknown"
        );
    }
}
