use apphc_backend::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster upgrade in progress")]
    InProgress,

    #[error("AppHoster cluster is locked")]
    Locked,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node {hostname} not drained after {secs}s")]
    DrainTimeout { hostname: String, secs: u64 },

    #[error("no upgrade available")]
    NotAvailable,

    #[error("found multiple upgrade resources")]
    MultipleResources,

    #[error("command '{command}' exited with status {status}: {message}")]
    Command {
        command: String,
        status: i32,
        message: String,
    },

    #[error("i/o with {host} failed: {source}")]
    Io {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ssh session with {host} failed: {source}")]
    Session {
        host: String,
        #[source]
        source: ssh2::Error,
    },

    #[error("ssh authentication of {user}@{host} rejected: {reason}")]
    Auth {
        user: String,
        host: String,
        reason: String,
    },

    #[error("remote command on {host} timed out after {secs}s")]
    Timeout { host: String, secs: u64 },

    #[error("remote shell task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid upgrade record: {0}")]
    Record(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn is_locked(&self) -> bool {
        matches!(self, ClusterError::InProgress | ClusterError::Locked)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ClusterError::NodeNotFound(_) => true,
            ClusterError::Backend(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
