use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Errors that could occur while building or installing a LogicMonitor backend.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The host configuration carried no `logicmonitor` block.
    #[error("no logicmonitor block in the host configuration")]
    MissingConfigBlock,

    /// A required setting was absent or empty.
    #[error("must set company/statsdAccessId/statsdToken in config, `{0}` is missing")]
    MissingField(&'static str),

    /// The configured protocol was neither `http` nor `https`.
    #[error("invalid protocol `{0}`, expected `http` or `https`")]
    InvalidScheme(String),

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Creating the fallback Tokio runtime failed.
    #[error("failed to create Tokio runtime: {0}")]
    FailedToCreateRuntime(String),
}

/// Terminal outcome of a single delivery that did not succeed.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The payload could not be serialized.
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// DNS, connect, TLS or I/O failure while talking to the endpoint.
    #[error("failed to send request: {0}")]
    Transport(#[source] reqwest::Error),

    /// No complete response arrived within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint answered with something other than `200 OK`.
    #[error("non-200 received - {0}")]
    Remote(StatusCode),

    /// The delivery task panicked or was cancelled by its runtime.
    #[error("delivery task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ForwardError {
    /// Short label used when recording the outcome as a metric.
    pub(crate) fn as_label(&self) -> &'static str {
        match self {
            Self::Serialization(_) => "serialization",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Remote(_) => "remote",
            Self::Task(_) => "task",
        }
    }
}

/// Protocol used to reach the endpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Port used when none is configured.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

impl FromStr for Scheme {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(BuildError::InvalidScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
