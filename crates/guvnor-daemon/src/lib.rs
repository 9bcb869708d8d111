pub mod api;
pub mod config;
pub mod error;
pub mod host;
pub mod proxy;
pub mod supervisor;
pub mod timeout;

pub use config::Config;
pub use error::{ProxyError, SupervisorError};
pub use host::{HostInfo, ServerDetails, ServerStatus};
pub use proxy::{ClusterHandle, PendingCall, ProcessEvent, ProcessMethod, ProcessProxy};
pub use supervisor::Supervisor;
pub use timeout::TimeoutPolicy;
