use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a response body is handed back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputMode {
    /// Drain and parse as JSON; an empty body decodes to `null`
    #[default]
    Json,
    /// Drain as UTF-8 text
    Text,
    /// Lazily decoded JSON values selected by a stream filter
    JsonStream,
    /// Lazily decoded UTF-8 chunks
    TextStream,
    /// Body piped into a caller sink by `stream()`
    DirectStream,
    /// The transport's raw response, no envelope
    FullResponse,
}

impl OutputMode {
    pub const ALL: [OutputMode; 6] = [
        OutputMode::Json,
        OutputMode::Text,
        OutputMode::JsonStream,
        OutputMode::TextStream,
        OutputMode::DirectStream,
        OutputMode::FullResponse,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OutputMode::Json => "json",
            OutputMode::Text => "text",
            OutputMode::JsonStream => "jsonStream",
            OutputMode::TextStream => "textStream",
            OutputMode::DirectStream => "directStream",
            OutputMode::FullResponse => "fullResponse",
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutputMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidOutputMode(s.to_owned()))
    }
}
