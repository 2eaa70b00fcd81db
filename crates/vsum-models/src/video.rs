//! YouTube URL parsing and normalisation.

use thiserror::Error;
use url::Url;

/// Errors that can occur during YouTube ID extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum YoutubeIdError {
    /// URL is not a valid YouTube URL
    #[error("URL is not a valid YouTube URL")]
    InvalidYoutubeUrl,
    /// Video ID has invalid format
    #[error("Video ID has invalid format")]
    InvalidVideoId,
    /// Video ID not found in URL
    #[error("Video ID not found in URL")]
    VideoIdNotFound,
}

/// Result type for YouTube ID extraction.
pub type YoutubeIdResult<T> = Result<T, YoutubeIdError>;

/// Path prefixes that carry the video ID as the next segment.
const PATH_PREFIXES: [&str; 4] = ["embed", "v", "shorts", "live"];

/// Extract the 11-character video ID from a YouTube URL.
///
/// Accepts `watch?v=`, `youtu.be/`, `/embed/`, `/v/`, `/shorts/` and
/// `/live/` forms, with or without scheme, `www.` or `m.` prefixes.
pub fn extract_youtube_id(raw: &str) -> YoutubeIdResult<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(YoutubeIdError::InvalidYoutubeUrl);
    }

    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let url = Url::parse(&with_scheme).map_err(|_| YoutubeIdError::InvalidYoutubeUrl)?;
    let host = url
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or(YoutubeIdError::InvalidYoutubeUrl)?;
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .unwrap_or(&host);

    let mut segments = url.path_segments().into_iter().flatten().filter(|s| !s.is_empty());

    let candidate = match host {
        "youtu.be" => segments.next().map(str::to_string),
        "youtube.com" | "youtube-nocookie.com" => match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            Some(prefix) if PATH_PREFIXES.contains(&prefix) => segments.next().map(str::to_string),
            _ => None,
        },
        _ => return Err(YoutubeIdError::InvalidYoutubeUrl),
    };

    match candidate {
        Some(id) => validate_youtube_id(id),
        None => Err(YoutubeIdError::VideoIdNotFound),
    }
}

/// Canonical watch URL for a video ID.
pub fn canonical_watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

fn validate_youtube_id(id: String) -> YoutubeIdResult<String> {
    let valid = id.len() == 11
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id)
    } else {
        Err(YoutubeIdError::InvalidVideoId)
    }
}
