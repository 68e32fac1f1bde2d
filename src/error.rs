use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Whether a failed fetch is worth retrying later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("fetch failed for {url} ({kind:?}): {message}")]
    Fetch {
        url: String,
        kind: FetchErrorKind,
        message: String,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("seen-set for scope `{scope}` is corrupt: {message}")]
    StoreCorrupt { scope: String, message: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watcher `{0}` already exists")]
    DuplicateName(String),

    #[error("watcher `{0}` does not exist")]
    NotFound(String),

    #[error("scope `{scope}` is already tracked by watcher `{owner}`")]
    ScopeInUse { scope: String, owner: String },

    #[error("invalid watcher config: {0}")]
    InvalidConfig(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("registry is shut down")]
    RegistryClosed,
}

impl WatchError {
    pub fn transient_fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            kind: FetchErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent_fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            kind: FetchErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Transient errors abort one cycle; the watcher keeps its schedule.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch { kind, .. } => *kind == FetchErrorKind::Transient,
            Self::Parse(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }
}
