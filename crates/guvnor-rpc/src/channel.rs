use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ChannelError;

pub type ResponseFuture = BoxFuture<'static, Result<Value, ChannelError>>;

/// Notifications a channel delivers after it is established.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The remote side emitted an event.
    Event { name: String, args: Vec<Value> },
    /// The channel ended. `reason` is set when it ended with an error.
    Closed { reason: Option<String> },
}

pub type EventSink = mpsc::UnboundedSender<ChannelEvent>;

/// An established channel to one remote endpoint.
pub trait RpcChannel: Send + Sync {
    /// Issues `method` before returning; the returned future resolves with the
    /// remote reply. Calls are handed to the transport in the order `call` is
    /// invoked.
    fn call(&self, method: &str, args: Vec<Value>) -> ResponseFuture;

    /// Ends the channel. Resolves once the close has completed.
    fn close(&self) -> BoxFuture<'static, ()>;
}

/// Result of a successful connect: the channel plus the method names the remote
/// announced as invocable.
pub struct Connected {
    pub channel: Arc<dyn RpcChannel>,
    pub methods: Vec<String>,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

pub trait ChannelFactory: Send + Sync {
    /// Opens a channel to `target`. Events received after the connect resolves
    /// are pushed into `events`.
    fn connect(&self, target: &str, events: EventSink) -> BoxFuture<'static, Result<Connected, ChannelError>>;
}
