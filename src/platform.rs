//! Maps a media URL to the site it points at.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Instagram,
    Tiktok,
    Twitter,
    Facebook,
    Spotify,
    Soundcloud,
    Vimeo,
    Dailymotion,
    Twitch,
    Reddit,
    Pinterest,
    Snapchat,
    Unknown,
}

// Order matters: the first rule with a matching host fragment wins.
const HOST_RULES: &[(&[&str], Platform)] = &[
    (&["youtube.com", "youtu.be"], Platform::Youtube),
    (&["instagram.com"], Platform::Instagram),
    (&["tiktok.com"], Platform::Tiktok),
    (&["twitter.com", "x.com"], Platform::Twitter),
    (&["facebook.com", "fb.watch"], Platform::Facebook),
    (&["spotify.com"], Platform::Spotify),
    (&["soundcloud.com"], Platform::Soundcloud),
    (&["vimeo.com"], Platform::Vimeo),
    (&["dailymotion.com"], Platform::Dailymotion),
    (&["twitch.tv"], Platform::Twitch),
    (&["reddit.com"], Platform::Reddit),
    (&["pinterest.com"], Platform::Pinterest),
    (&["snapchat.com"], Platform::Snapchat),
];

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Instagram => "instagram",
            Self::Tiktok => "tiktok",
            Self::Twitter => "twitter",
            Self::Facebook => "facebook",
            Self::Spotify => "spotify",
            Self::Soundcloud => "soundcloud",
            Self::Vimeo => "vimeo",
            Self::Dailymotion => "dailymotion",
            Self::Twitch => "twitch",
            Self::Reddit => "reddit",
            Self::Pinterest => "pinterest",
            Self::Snapchat => "snapchat",
            Self::Unknown => "unknown",
        }
    }

    /// Inverse of [`Platform::as_str`]; anything unrecognised maps to `Unknown`.
    pub fn from_tag(tag: &str) -> Self {
        HOST_RULES
            .iter()
            .map(|(_, platform)| *platform)
            .find(|platform| platform.as_str() == tag)
            .unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substring match against the lower-cased URL. Total: never fails.
pub fn detect(url: &str) -> Platform {
    let lowered = url.to_lowercase();
    HOST_RULES
        .iter()
        .find(|(hosts, _)| hosts.iter().any(|host| lowered.contains(host)))
        .map(|(_, platform)| *platform)
        .unwrap_or(Platform::Unknown)
}
