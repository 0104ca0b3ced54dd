use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Auth,
    Forbidden,
    NotFound,
    RateLimited,
    Server,
    Network,
    Other,
}

impl FailureKind {
    pub fn user_message(self) -> &'static str {
        match self {
            FailureKind::Auth => "authentication failed (401): check PIPELINES_API_TOKEN and PIPELINES_AUTH_FORMAT",
            FailureKind::Forbidden => "access denied (403): the API key lacks permission for pipelines",
            FailureKind::NotFound => "endpoint not found (404): check PIPELINES_API_BASE_URL",
            FailureKind::RateLimited => "rate limit reached (429): data will refresh automatically once the window resets",
            FailureKind::Server => "upstream server error (500): the pipelines API may be temporarily unavailable",
            FailureKind::Network => "network error: the pipelines API could not be reached",
            FailureKind::Other => "unexpected error while loading pipeline data",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream HTTP {status}: {body}")]
    Status {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("upstream request failed: {0}")]
    Transport(String),
}

impl UpstreamError {
    pub fn status(status: StatusCode) -> Self {
        UpstreamError::Status {
            status,
            body: String::new(),
            retry_after: None,
        }
    }

    pub fn http_status(&self) -> Option<StatusCode> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self.http_status(),
            Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        self.http_status() == Some(StatusCode::TOO_MANY_REQUESTS)
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            UpstreamError::Status { status, .. } => match *status {
                StatusCode::UNAUTHORIZED => FailureKind::Auth,
                StatusCode::FORBIDDEN => FailureKind::Forbidden,
                StatusCode::NOT_FOUND => FailureKind::NotFound,
                StatusCode::TOO_MANY_REQUESTS => FailureKind::RateLimited,
                s if s.is_server_error() => FailureKind::Server,
                _ => FailureKind::Other,
            },
            UpstreamError::Transport(_) => FailureKind::Network,
        }
    }
}

/// Classifies an error chain for display. Non-upstream errors keep their own message.
pub fn describe(err: &anyhow::Error) -> (FailureKind, String) {
    let upstream = err
        .chain()
        .find_map(|e| e.downcast_ref::<UpstreamError>());
    match upstream {
        Some(e) => match e.kind() {
            FailureKind::Other => (FailureKind::Other, format!("{e}")),
            kind => (kind, kind.user_message().to_string()),
        },
        None => (FailureKind::Other, format!("{err:#}")),
    }
}
