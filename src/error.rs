use crate::types::{CheckpointId, ContainerId};

#[derive(Debug, thiserror::Error)]
pub enum IceboxError {
    #[error("container {0} is not running")]
    NotRunning(ContainerId),

    #[error("container {0} already has a running init")]
    AlreadyRunning(ContainerId),

    #[error("no checkpoint {checkpoint} for container {container}")]
    CheckpointNotFound {
        container: ContainerId,
        checkpoint: CheckpointId,
    },

    #[error("checkpoint {checkpoint} already exists for container {container}")]
    CheckpointExists {
        container: ContainerId,
        checkpoint: CheckpointId,
    },

    #[error("criu {operation} exited with status {status}: {output}")]
    FreezerFailed {
        operation: &'static str,
        status: i32,
        output: String,
    },

    #[error("{file}: decode failure at offset {offset}: {reason}")]
    ImageFormat {
        file: String,
        offset: u64,
        reason: String,
    },

    #[error("pattern not found: {0}")]
    RewriteMiss(String),

    #[error("unknown directive key: {0}")]
    UnknownDirective(String),

    #[error("directive {directive} failed: {source}")]
    Directive {
        directive: String,
        #[source]
        source: Box<IceboxError>,
    },

    #[error("host state: {0}")]
    HostState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl IceboxError {
    /// Wrap an error with the rewrite directive that triggered it.
    pub fn in_directive(self, directive: impl Into<String>) -> Self {
        Self::Directive {
            directive: directive.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, IceboxError>;
