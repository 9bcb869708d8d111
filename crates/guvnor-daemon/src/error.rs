use std::time::Duration;

use guvnor_process::ProcessId;
use guvnor_rpc::ChannelError;
use thiserror::Error;

/// Failure delivered through a process call's completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("{method} failed: {message}")]
    Invocation { method: String, message: String },

    #[error("process is not a cluster")]
    NotCluster,
}

impl ProxyError {
    /// Remote failures keep their message; anything else means the channel is
    /// unusable.
    pub(crate) fn from_channel(method: &str, err: ChannelError) -> Self {
        match err {
            ChannelError::Remote(message) => ProxyError::Invocation {
                method: method.to_string(),
                message,
            },
            other => ProxyError::Connection(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("process already registered: {0}")]
    Duplicate(ProcessId),

    #[error("process not found: {0}")]
    NotFound(ProcessId),
}
