//! Error types for the tagvault core library.

/// Coarse classification used when reporting a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, timeout or TLS failures. Safe to retry from the resume counter.
    Transport,
    /// Malformed or unexpected data from the remote feed.
    Protocol,
    /// Local store, filesystem or external-sort failures.
    Storage,
    /// Failure while merging remote tags into local records.
    Reconciliation,
    /// Invalid or missing configuration.
    Configuration,
    /// Stopped on request.
    Cancelled,
}

/// Top-level error enum for the tagvault core library.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Decode error: {reason}: `{fragment}`")]
    Decode { reason: String, fragment: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Worker pool error: {0}")]
    Pool(String),

    #[error("sync cancelled")]
    Cancelled,

    #[error("sync aborted after {applied} of {total} updates: {source}")]
    Aborted {
        applied: usize,
        total: usize,
        #[source]
        source: Box<VaultError>,
    },

    #[error("tag reconciliation aborted after {processed} of {total} records: {source}")]
    Reconcile {
        processed: usize,
        total: usize,
        #[source]
        source: Box<VaultError>,
    },
}

/// Longest raw fragment kept on a decode error.
const MAX_FRAGMENT_BYTES: usize = 512;

impl VaultError {
    /// Build a decode error carrying (a bounded prefix of) the offending JSON.
    pub fn decode(reason: impl Into<String>, fragment: impl AsRef<str>) -> Self {
        let fragment = fragment.as_ref();
        let fragment = if fragment.len() > MAX_FRAGMENT_BYTES {
            let mut end = MAX_FRAGMENT_BYTES;
            while !fragment.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &fragment[..end])
        } else {
            fragment.to_string()
        };
        VaultError::Decode {
            reason: reason.into(),
            fragment,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Transport(_) | VaultError::Status { .. } | VaultError::Auth(_) => {
                ErrorKind::Transport
            }
            VaultError::Decode { .. } | VaultError::Json(_) => ErrorKind::Protocol,
            VaultError::Store(_)
            | VaultError::Sqlite(_)
            | VaultError::Io(_)
            | VaultError::Pool(_) => ErrorKind::Storage,
            VaultError::Cancelled => ErrorKind::Cancelled,
            VaultError::Config(_) => ErrorKind::Configuration,
            VaultError::Aborted { source, .. } => source.kind(),
            VaultError::Reconcile { .. } => ErrorKind::Reconciliation,
        }
    }

    /// Whether re-invoking the sync is expected to make progress without
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Storage | ErrorKind::Reconciliation
        )
    }

    /// Process exit status for the command-line front end.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            ErrorKind::Transport => 10,
            ErrorKind::Protocol => 11,
            ErrorKind::Storage => 12,
            ErrorKind::Reconciliation => 13,
            ErrorKind::Cancelled => 130,
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;
