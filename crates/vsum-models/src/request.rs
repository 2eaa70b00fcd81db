//! Validated submission requests.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::video::{canonical_watch_url, extract_youtube_id, YoutubeIdError};

/// Document format the summary is rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Txt,
    Docx,
    Pdf,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [OutputFormat::Txt, OutputFormat::Docx, OutputFormat::Pdf];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Txt => "txt",
            OutputFormat::Docx => "docx",
            OutputFormat::Pdf => "pdf",
        }
    }

    /// Parse a comma-separated list such as `"txt, pdf"`.
    ///
    /// Unknown entries are skipped; an empty result falls back to all formats.
    pub fn parse_list(raw: &str) -> Vec<OutputFormat> {
        let formats: Vec<OutputFormat> = raw
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect();
        if formats.is_empty() {
            Self::ALL.to_vec()
        } else {
            formats
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "txt" => Ok(OutputFormat::Txt),
            "docx" => Ok(OutputFormat::Docx),
            "pdf" => Ok(OutputFormat::Pdf),
            other => Err(RequestError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Errors raised while validating a submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Invalid video URL: {0}")]
    InvalidUrl(#[from] YoutubeIdError),

    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),
}

/// A validated summarization request: what to fetch and how to render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobRequest {
    /// Canonical `https://www.youtube.com/watch?v=...` URL
    pub video_url: String,
    /// 11-character video ID
    pub video_id: String,
    /// Requested output format
    pub format: OutputFormat,
}

impl JobRequest {
    /// Validate a raw video reference and build a request.
    pub fn new(reference: &str, format: OutputFormat) -> Result<Self, RequestError> {
        let video_id = extract_youtube_id(reference)?;
        Ok(Self {
            video_url: canonical_watch_url(&video_id),
            video_id,
            format,
        })
    }

    /// Validate against the formats this deployment can render.
    pub fn ensure_supported(self, supported: &[OutputFormat]) -> Result<Self, RequestError> {
        if supported.contains(&self.format) {
            Ok(self)
        } else {
            Err(RequestError::UnsupportedFormat(self.format.to_string()))
        }
    }
}
