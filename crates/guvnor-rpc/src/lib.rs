//! Call/event channel between the daemon and supervised processes.
//!
//! [`channel`] is the contract the process proxy is written against. [`client`]
//! and [`endpoint`] are the WebSocket implementation of both ends, speaking the
//! JSON frames in [`frame`].

pub mod channel;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod frame;

pub use channel::{ChannelEvent, ChannelFactory, Connected, EventSink, ResponseFuture, RpcChannel};
pub use client::{ChannelOptions, WsChannelFactory};
pub use endpoint::{Emitter, Endpoint, bearer_token};
pub use error::ChannelError;
