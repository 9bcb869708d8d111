use std::{collections::BTreeMap, future::Future, sync::Arc};

use futures_util::{FutureExt, SinkExt, StreamExt, future::BoxFuture};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::mpsc,
};
use tokio_tungstenite::tungstenite::{
    Message as WsMessage,
    handshake::server::{ErrorResponse, Request, Response},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
};
use tracing::{Instrument, info_span};

use crate::error::ChannelError;
use crate::frame::{ClientFrame, EndpointFrame};

type Handler = Arc<dyn Fn(Vec<Value>, Emitter) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Pushes events to the daemon over the session the handler was invoked on.
#[derive(Clone)]
pub struct Emitter {
    tx: mpsc::UnboundedSender<EndpointFrame>,
}

impl Emitter {
    pub fn emit(&self, name: impl Into<String>, args: Vec<Value>) {
        let _ = self.tx.send(EndpointFrame::Event {
            name: name.into(),
            args,
        });
    }
}

/// Process side of a channel: a table of named async handlers served over
/// WebSocket. Every new session is greeted with the handler names.
#[derive(Clone, Default)]
pub struct Endpoint {
    handlers: BTreeMap<String, Handler>,
    token: Option<Arc<str>>,
}

impl Endpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `Authorization: Bearer <token>` on the upgrade request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = (!token.trim().is_empty()).then(|| Arc::from(token.trim()));
        self
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>, Emitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args, emitter| handler(args, emitter).boxed());
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn methods(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let endpoint = self.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = endpoint.serve_connection(stream).await {
                        tracing::warn!(error = %e, "rpc session ended with error");
                    }
                }
                .instrument(info_span!("rpc_endpoint", %peer)),
            );
        }
    }

    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let expected = self.token.clone();
        let check = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if auth_ok(req.headers(), expected.as_deref()) {
                return Ok(resp);
            }
            let mut denied = ErrorResponse::new(Some("unauthorized".to_string()));
            *denied.status_mut() = StatusCode::UNAUTHORIZED;
            Err(denied)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, check)
            .await
            .map_err(|e| ChannelError::Handshake(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let hello = EndpointFrame::Hello {
            methods: self.methods(),
        };
        send_frame(&mut sink, &hello).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<EndpointFrame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if send_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }
        });

        let emitter = Emitter { tx: tx.clone() };

        while let Some(msg) = stream.next().await {
            let Ok(msg) = msg else { break };
            match msg {
                WsMessage::Text(text) => {
                    let Ok(ClientFrame::Req { id, method, args }) = serde_json::from_str::<ClientFrame>(&text) else {
                        continue;
                    };
                    let Some(handler) = self.handlers.get(&method) else {
                        let _ = tx.send(EndpointFrame::Resp {
                            id,
                            ok: false,
                            result: Value::Null,
                            error: Some(format!("unknown method: {method}")),
                        });
                        continue;
                    };

                    let call = handler(args, emitter.clone());
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let frame = match call.await {
                            Ok(result) => EndpointFrame::Resp {
                                id,
                                ok: true,
                                result,
                                error: None,
                            },
                            Err(message) => EndpointFrame::Resp {
                                id,
                                ok: false,
                                result: Value::Null,
                                error: Some(message),
                            },
                        };
                        let _ = tx.send(frame);
                    });
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }

        writer.abort();
        Ok(())
    }
}

/// Token from an `Authorization: Bearer <token>` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

fn auth_ok(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    bearer_token(headers).is_some_and(|got| got == expected)
}

async fn send_frame<K>(sink: &mut K, frame: &EndpointFrame) -> Result<(), ChannelError>
where
    K: futures_util::Sink<WsMessage> + Unpin,
    K::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame).map_err(|e| ChannelError::Encode(e.to_string()))?;
    sink.send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| ChannelError::Connect(e.to_string()))
}
