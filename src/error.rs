use serde::ser::Serializer;
use thiserror::Error;

pub type FeedResult<T> = Result<T, FeedError>;

#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("transport error on {topic}: {reason}")]
    Transport { topic: String, reason: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("pull request failed: {0}")]
    Pull(String),
    #[error("fallback exhausted for {topic} after {attempts} failed pulls: {last_error}")]
    FallbackExhausted {
        topic: String,
        attempts: u32,
        last_error: String,
    },
}

impl FeedError {
    pub fn transport(topic: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(value: reqwest::Error) -> Self {
        Self::Pull(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport {
            topic: String::new(),
            reason: value.to_string(),
        }
    }
}

impl From<simd_json::Error> for FeedError {
    fn from(value: simd_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<std::num::ParseFloatError> for FeedError {
    fn from(value: std::num::ParseFloatError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl serde::Serialize for FeedError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
