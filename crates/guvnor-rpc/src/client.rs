use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::{
    FutureExt, SinkExt, StreamExt,
    future::BoxFuture,
    stream::{SplitSink, SplitStream},
};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{Message as WsMessage, client::IntoClientRequest},
};
use tracing::{Instrument, info_span};

use crate::channel::{ChannelEvent, ChannelFactory, Connected, EventSink, ResponseFuture, RpcChannel};
use crate::error::ChannelError;
use crate::frame::{ClientFrame, EndpointFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Upper bound for socket connect plus the remote's `hello`. `None` waits
    /// until the transport itself gives up.
    pub handshake_timeout: Option<Duration>,
    /// Sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WsChannelFactory {
    options: ChannelOptions,
}

impl WsChannelFactory {
    pub fn new(options: ChannelOptions) -> Self {
        Self { options }
    }
}

impl ChannelFactory for WsChannelFactory {
    fn connect(
        &self,
        target: &str,
        events: EventSink,
    ) -> BoxFuture<'static, Result<Connected, ChannelError>> {
        let target = target.to_string();
        let options = self.options.clone();
        async move {
            let handshake = open(&target, options.token.as_deref());
            let (ws, methods) = match options.handshake_timeout {
                Some(limit) => tokio::time::timeout(limit, handshake)
                    .await
                    .map_err(|_| ChannelError::Handshake(format!("no hello within {limit:?}")))??,
                None => handshake.await?,
            };
            tracing::debug!(%target, methods = methods.len(), "remote ready");
            Ok(WsChannel::start(ws, methods, events, &target))
        }
        .boxed()
    }
}

async fn open(target: &str, token: Option<&str>) -> Result<(WsStream, Vec<String>), ChannelError> {
    let mut req = target
        .into_client_request()
        .map_err(|e| ChannelError::Connect(e.to_string()))?;
    if let Some(tok) = token {
        let value = format!("Bearer {tok}")
            .parse()
            .map_err(|_| ChannelError::Connect("token is not a valid header value".to_string()))?;
        req.headers_mut().insert("Authorization", value);
    }

    let (mut ws, _) = tokio_tungstenite::connect_async(req)
        .await
        .map_err(|e| ChannelError::Connect(e.to_string()))?;

    while let Some(msg) = ws.next().await {
        match msg.map_err(|e| ChannelError::Handshake(e.to_string()))? {
            WsMessage::Text(text) => {
                if let Ok(EndpointFrame::Hello { methods }) = serde_json::from_str::<EndpointFrame>(&text) {
                    return Ok((ws, methods));
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    Err(ChannelError::Handshake(
        "remote closed before announcing its methods".to_string(),
    ))
}

#[derive(Default)]
struct PendingCalls {
    closed: bool,
    waiting: HashMap<u64, oneshot::Sender<Result<Value, ChannelError>>>,
}

type Pending = Arc<Mutex<PendingCalls>>;

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct WsChannel {
    tx: mpsc::UnboundedSender<WsMessage>,
    pending: Pending,
    next_id: AtomicU64,
    closed: watch::Receiver<bool>,
}

impl WsChannel {
    fn start(ws: WsStream, methods: Vec<String>, events: EventSink, target: &str) -> Connected {
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
        let pending: Pending = Arc::default();
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(write_loop(sink, rx));
        tokio::spawn(
            read_loop(stream, pending.clone(), events, closed_tx)
                .instrument(info_span!("rpc_channel", target = %target)),
        );

        Connected {
            channel: Arc::new(WsChannel {
                tx,
                pending,
                next_id: AtomicU64::new(1),
                closed: closed_rx,
            }),
            methods,
        }
    }
}

impl RpcChannel for WsChannel {
    fn call(&self, method: &str, args: Vec<Value>) -> ResponseFuture {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = ClientFrame::Req {
            id,
            method: method.to_string(),
            args,
        };
        let text = match serde_json::to_string(&frame) {
            Ok(v) => v,
            Err(e) => return futures_util::future::ready(Err(ChannelError::Encode(e.to_string()))).boxed(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return futures_util::future::ready(Err(ChannelError::Closed)).boxed();
            }
            pending.waiting.insert(id, reply_tx);
        }

        if self.tx.send(WsMessage::Text(text.into())).is_err() {
            lock(&self.pending).waiting.remove(&id);
            return futures_util::future::ready(Err(ChannelError::Closed)).boxed();
        }

        async move { reply_rx.await.unwrap_or(Err(ChannelError::Closed)) }.boxed()
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let _ = self.tx.send(WsMessage::Close(None));
        let mut closed = self.closed.clone();
        async move {
            let _ = closed.wait_for(|c| *c).await;
        }
        .boxed()
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, WsMessage>, mut rx: mpsc::UnboundedReceiver<WsMessage>) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, WsMessage::Close(_));
        if sink.send(msg).await.is_err() || is_close {
            break;
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    pending: Pending,
    events: EventSink,
    closed: watch::Sender<bool>,
) {
    let mut reason = None;

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(v) => v,
            Err(e) => {
                reason = Some(e.to_string());
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => {
                let frame = serde_json::from_str::<EndpointFrame>(&text).unwrap_or(EndpointFrame::Unknown);
                match frame {
                    EndpointFrame::Resp { id, ok, result, error } => {
                        let tx = lock(&pending).waiting.remove(&id);
                        if let Some(tx) = tx {
                            let reply = if ok {
                                Ok(result)
                            } else {
                                Err(ChannelError::Remote(
                                    error.unwrap_or_else(|| "remote call failed".to_string()),
                                ))
                            };
                            let _ = tx.send(reply);
                        }
                    }
                    EndpointFrame::Event { name, args } => {
                        let _ = events.send(ChannelEvent::Event { name, args });
                    }
                    EndpointFrame::Hello { .. } | EndpointFrame::Unknown => {}
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    let orphaned = {
        let mut pending = lock(&pending);
        pending.closed = true;
        std::mem::take(&mut pending.waiting)
    };
    for (_, tx) in orphaned {
        let _ = tx.send(Err(ChannelError::Closed));
    }

    match &reason {
        Some(e) => tracing::warn!(error = %e, "channel ended with error"),
        None => tracing::debug!("channel closed"),
    }
    let _ = events.send(ChannelEvent::Closed { reason });
    let _ = closed.send(true);
}
