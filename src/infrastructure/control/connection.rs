//! Request-id multiplexing over one framed stream.
//!
//! Every connection has a caller side (`RpcClient`) and a handler side
//! (`serve_connection`). Frames are length-delimited JSON; the id pairs a
//! request with its response and any stream items flowing either way.
//! Unary, server-streaming, client-streaming and bidirectional exchanges
//! all reduce to the same frame grammar, so one reader task per connection
//! is enough.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::domain::error::ControlError;
use crate::infrastructure::control::protocol::{
    Frame, FrameBody, Request, Response, StreamItem, WireError,
};
use crate::infrastructure::pki::PeerIdentity;

const WRITER_QUEUE: usize = 256;
const STREAM_QUEUE: usize = 256;

/// Events observed by the caller of a streaming exchange.
#[derive(Debug)]
pub enum StreamEvent {
    Item(StreamItem),
    /// The callee finished sending items; a Response still follows.
    End { error: Option<String> },
    /// Terminal response; nothing follows.
    Response(Result<Response, WireError>),
}

enum Pending {
    Unary(oneshot::Sender<Result<Response, WireError>>),
    Stream(mpsc::Sender<StreamEvent>),
}

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

fn encode(frame: &Frame) -> Result<tokio_util::bytes::Bytes, ControlError> {
    serde_json::to_vec(frame)
        .map(tokio_util::bytes::Bytes::from)
        .map_err(|e| ControlError::Codec(e.to_string()))
}

fn spawn_writer<W>(
    write_half: W,
    mut rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = FramedWrite::new(write_half, LengthDelimitedCodec::new());
        while let Some(frame) = rx.recv().await {
            let bytes = match encode(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if framed.send(bytes).await.is_err() {
                break;
            }
        }
        closed.cancel();
    })
}

/// Caller side of a connection.
pub struct RpcClient {
    writer: mpsc::Sender<Frame>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl RpcClient {
    /// Drive an established bidirectional byte stream as the caller side.
    pub fn start<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (writer_tx, writer_rx) = mpsc::channel::<Frame>(WRITER_QUEUE);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        spawn_writer(write_half, writer_rx, closed.clone());

        let reader_pending = Arc::clone(&pending);
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let mut framed = FramedRead::new(read_half, LengthDelimitedCodec::new());
            loop {
                let next = tokio::select! {
                    next = framed.next() => next,
                    () = reader_closed.cancelled() => break,
                };
                let Some(Ok(bytes)) = next else { break };
                let frame: Frame = match serde_json::from_slice(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable frame");
                        continue;
                    }
                };
                route_inbound(&reader_pending, frame);
            }
            reader_closed.cancel();
            // Complete whatever is still outstanding with a closed error.
            let mut pending = reader_pending.lock().expect("pending lock poisoned");
            for (_, slot) in pending.drain() {
                match slot {
                    Pending::Unary(tx) => {
                        let _ = tx.send(Err(WireError::internal("connection closed")));
                    }
                    Pending::Stream(tx) => {
                        let _ = tx.try_send(StreamEvent::Response(Err(WireError::internal(
                            "connection closed",
                        ))));
                    }
                }
            }
        });

        Self {
            writer: writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
        }
    }

    /// Dial a TLS endpoint and start the caller side over it.
    pub async fn connect_tls(
        addr: &str,
        config: Arc<rustls::ClientConfig>,
        name: rustls::pki_types::ServerName<'static>,
    ) -> Result<(Self, PeerIdentity), ControlError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| ControlError::Connect(format!("{addr}: {e}")))?;
        tcp.set_nodelay(true).ok();
        let connector = TlsConnector::from(config);
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| ControlError::Tls(e.to_string()))?;
        let identity = super::tls::peer_identity_from_client_conn(tls.get_ref().1)?;
        Ok((Self::start(tls), identity))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Tear the connection down; outstanding calls fail with a closed error.
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), ControlError> {
        if self.closed.is_cancelled() {
            return Err(ControlError::ClosedEarly);
        }
        self.writer
            .send(frame)
            .await
            .map_err(|_| ControlError::ClosedEarly)
    }

    /// Unary call with a deadline.
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Response, ControlError> {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, Pending::Unary(tx));
        trace!(id, op = request.op_name(), "sending unary request");
        self.send_frame(Frame { id, body: FrameBody::Request(request) })
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map_err(|e| ControlError::Remote(e.to_string())),
            Ok(Err(_)) => Err(ControlError::ClosedEarly),
            Err(_) => {
                self.pending.lock().expect("pending lock poisoned").remove(&id);
                let _ = self.writer.try_send(Frame { id, body: FrameBody::Cancel });
                Err(ControlError::Timeout(timeout.as_secs()))
            }
        }
    }

    /// Open a streaming exchange. Works for server-streaming (consume
    /// events), client-streaming (send items, finish, await response) and
    /// bidirectional use.
    pub async fn open_stream(&self, request: Request) -> Result<RpcStream, ControlError> {
        let id = self.allocate_id();
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, Pending::Stream(tx));
        trace!(id, op = request.op_name(), "opening stream");
        self.send_frame(Frame { id, body: FrameBody::Request(request) })
            .await?;
        Ok(RpcStream {
            id,
            rx,
            writer: self.writer.clone(),
            pending: Arc::clone(&self.pending),
            finished: false,
        })
    }
}

fn route_inbound(pending: &PendingMap, frame: Frame) {
    let mut map = pending.lock().expect("pending lock poisoned");
    match frame.body {
        FrameBody::Response(result) => match map.remove(&frame.id) {
            Some(Pending::Unary(tx)) => {
                let _ = tx.send(result);
            }
            Some(Pending::Stream(tx)) => {
                let _ = tx.try_send(StreamEvent::Response(result));
            }
            None => trace!(id = frame.id, "response for unknown exchange"),
        },
        FrameBody::StreamItem(item) => {
            if let Some(Pending::Stream(tx)) = map.get(&frame.id) {
                if tx.try_send(StreamEvent::Item(item)).is_err() {
                    warn!(id = frame.id, "stream receiver lagging, dropping item");
                }
            }
        }
        FrameBody::StreamEnd { error } => {
            if let Some(Pending::Stream(tx)) = map.get(&frame.id) {
                let _ = tx.try_send(StreamEvent::End { error });
            }
        }
        FrameBody::Request(_) | FrameBody::Cancel => {
            trace!(id = frame.id, "caller side ignoring inbound request/cancel");
        }
    }
}

/// Caller handle on one streaming exchange.
pub struct RpcStream {
    id: u64,
    rx: mpsc::Receiver<StreamEvent>,
    writer: mpsc::Sender<Frame>,
    pending: PendingMap,
    finished: bool,
}

impl RpcStream {
    /// Next event; `None` only if the connection died without a response.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await;
        if matches!(event, Some(StreamEvent::Response(_)) | None) {
            self.finished = true;
        }
        event
    }

    /// Send one item toward the callee (client-streaming / bidi).
    pub async fn send_item(&self, item: StreamItem) -> Result<(), ControlError> {
        self.writer
            .send(Frame { id: self.id, body: FrameBody::StreamItem(item) })
            .await
            .map_err(|_| ControlError::ClosedEarly)
    }

    /// Signal no more items from this side.
    pub async fn finish_sending(&self) -> Result<(), ControlError> {
        self.writer
            .send(Frame { id: self.id, body: FrameBody::StreamEnd { error: None } })
            .await
            .map_err(|_| ControlError::ClosedEarly)
    }

    /// Abort the exchange.
    pub async fn cancel(&mut self) {
        self.finished = true;
        self.pending.lock().expect("pending lock poisoned").remove(&self.id);
        let _ = self.writer.send(Frame { id: self.id, body: FrameBody::Cancel }).await;
    }
}

impl Drop for RpcStream {
    fn drop(&mut self) {
        self.pending.lock().expect("pending lock poisoned").remove(&self.id);
        if !self.finished {
            // Exchange abandoned mid-flight; tell the callee to stop.
            let _ = self.writer.try_send(Frame { id: self.id, body: FrameBody::Cancel });
        }
    }
}

/// One inbound item on the handler side of a streaming exchange.
#[derive(Debug)]
pub enum InboundItem {
    Item(StreamItem),
    End { error: Option<String> },
}

/// Per-exchange context handed to the handler.
pub struct RpcContext {
    id: u64,
    writer: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<InboundItem>,
    /// Fired when the caller cancels or the connection drops.
    pub cancelled: CancellationToken,
}

impl RpcContext {
    /// Emit one stream item toward the caller.
    pub async fn send_item(&self, item: StreamItem) -> Result<(), ControlError> {
        self.writer
            .send(Frame { id: self.id, body: FrameBody::StreamItem(item) })
            .await
            .map_err(|_| ControlError::ClosedEarly)
    }

    /// Next inbound item from the caller (client-streaming / bidi);
    /// `None` once the caller is done or gone.
    pub async fn next_inbound(&mut self) -> Option<InboundItem> {
        self.inbound.recv().await
    }
}

/// Handler side of a connection: dispatches every request to `handler`.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        peer: &PeerIdentity,
        request: Request,
        ctx: RpcContext,
    ) -> Result<Response, WireError>;
}

struct Exchange {
    inbound: mpsc::Sender<InboundItem>,
    cancel: CancellationToken,
}

/// Serve one accepted connection until it closes or `shutdown` fires.
pub async fn serve_connection<S, H>(
    io: S,
    peer: PeerIdentity,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: RpcHandler + ?Sized,
{
    let (read_half, write_half) = tokio::io::split(io);
    let (writer_tx, writer_rx) = mpsc::channel::<Frame>(WRITER_QUEUE);
    let conn_closed = CancellationToken::new();
    spawn_writer(write_half, writer_rx, conn_closed.clone());

    let exchanges: Arc<Mutex<HashMap<u64, Exchange>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut framed = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let peer = Arc::new(peer);

    loop {
        let next = tokio::select! {
            next = framed.next() => next,
            () = shutdown.cancelled() => break,
            () = conn_closed.cancelled() => break,
        };
        let Some(Ok(bytes)) = next else { break };
        let frame: Frame = match serde_json::from_slice(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                continue;
            }
        };

        match frame.body {
            FrameBody::Request(request) => {
                let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_QUEUE);
                let cancel = CancellationToken::new();
                exchanges.lock().expect("exchange lock poisoned").insert(
                    frame.id,
                    Exchange { inbound: inbound_tx, cancel: cancel.clone() },
                );

                let ctx = RpcContext {
                    id: frame.id,
                    writer: writer_tx.clone(),
                    inbound: inbound_rx,
                    cancelled: cancel,
                };
                let handler = Arc::clone(&handler);
                let peer = Arc::clone(&peer);
                let writer = writer_tx.clone();
                let exchanges = Arc::clone(&exchanges);
                let id = frame.id;
                tokio::spawn(async move {
                    debug!(id, op = request.op_name(), peer = %peer.common_name, "dispatching request");
                    let result = handler.handle(&peer, request, ctx).await;
                    let _ = writer.send(Frame { id, body: FrameBody::Response(result) }).await;
                    exchanges.lock().expect("exchange lock poisoned").remove(&id);
                });
            }
            FrameBody::StreamItem(item) => {
                let sender = {
                    let map = exchanges.lock().expect("exchange lock poisoned");
                    map.get(&frame.id).map(|e| e.inbound.clone())
                };
                if let Some(sender) = sender {
                    let _ = sender.send(InboundItem::Item(item)).await;
                } else {
                    trace!(id = frame.id, "stream item for unknown exchange");
                }
            }
            FrameBody::StreamEnd { error } => {
                let sender = {
                    let map = exchanges.lock().expect("exchange lock poisoned");
                    map.get(&frame.id).map(|e| e.inbound.clone())
                };
                if let Some(sender) = sender {
                    let _ = sender.send(InboundItem::End { error }).await;
                }
            }
            FrameBody::Cancel => {
                let exchange = exchanges.lock().expect("exchange lock poisoned").remove(&frame.id);
                if let Some(exchange) = exchange {
                    debug!(id = frame.id, "caller cancelled exchange");
                    exchange.cancel.cancel();
                }
            }
            FrameBody::Response(_) => {
                trace!(id = frame.id, "handler side ignoring inbound response");
            }
        }
    }

    // Connection is going away: cancel everything still running.
    let map = std::mem::take(&mut *exchanges.lock().expect("exchange lock poisoned"));
    for (_, exchange) in map {
        exchange.cancel.cancel();
    }
    conn_closed.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeploymentId;
    use crate::infrastructure::control::protocol::ErrorCode;

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(
            &self,
            _peer: &PeerIdentity,
            request: Request,
            ctx: RpcContext,
        ) -> Result<Response, WireError> {
            match request {
                Request::Heartbeat { .. } => Ok(Response::HeartbeatAck { commands: vec![] }),
                Request::GetSystemInfo => Err(WireError::new(ErrorCode::Internal, "boom")),
                Request::StreamDeployLogs { .. } => {
                    for i in 0..3 {
                        ctx.send_item(StreamItem::LogLine { line: format!("line-{i}") })
                            .await
                            .map_err(|e| WireError::internal(e.to_string()))?;
                    }
                    Ok(Response::StreamDone)
                }
                Request::PushUpdate { .. } => {
                    let mut ctx = ctx;
                    let mut bytes = 0;
                    while let Some(item) = ctx.next_inbound().await {
                        match item {
                            InboundItem::Item(StreamItem::UpdateChunk { data_hex }) => {
                                bytes += data_hex.len() / 2;
                            }
                            InboundItem::End { .. } => break,
                            InboundItem::Item(_) => {}
                        }
                    }
                    Ok(Response::PushUpdateAck {
                        success: true,
                        message: format!("{bytes} bytes"),
                    })
                }
                _ => Err(WireError::new(ErrorCode::InvalidArgument, "unsupported")),
            }
        }
    }

    fn test_peer() -> PeerIdentity {
        PeerIdentity {
            common_name: "test-peer".to_string(),
            organizational_unit: Some("caravel-agent".to_string()),
        }
    }

    async fn pipe_pair() -> (RpcClient, tokio::task::JoinHandle<()>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let _ = serve_connection(
                server_io,
                test_peer(),
                Arc::new(EchoHandler),
                CancellationToken::new(),
            )
            .await;
        });
        (RpcClient::start(client_io), server)
    }

    #[tokio::test]
    async fn test_unary_round_trip() {
        let (client, _server) = pipe_pair().await;
        let response = client
            .call(Request::Heartbeat { agent_version: "1".into() }, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(response, Response::HeartbeatAck { .. }));
    }

    #[tokio::test]
    async fn test_unary_error_propagates() {
        let (client, _server) = pipe_pair().await;
        let err = client
            .call(Request::GetSystemInfo, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Remote(_)));
    }

    #[tokio::test]
    async fn test_server_streaming_delivers_items_then_response() {
        let (client, _server) = pipe_pair().await;
        let mut stream = client
            .open_stream(Request::StreamDeployLogs { deployment_id: DeploymentId::new() })
            .await
            .unwrap();

        let mut lines = Vec::new();
        loop {
            match stream.next().await.unwrap() {
                StreamEvent::Item(StreamItem::LogLine { line }) => lines.push(line),
                StreamEvent::Response(result) => {
                    assert!(matches!(result.unwrap(), Response::StreamDone));
                    break;
                }
                StreamEvent::Item(_) | StreamEvent::End { .. } => {}
            }
        }
        assert_eq!(lines, vec!["line-0", "line-1", "line-2"]);
    }

    #[tokio::test]
    async fn test_client_streaming_push() {
        let (client, _server) = pipe_pair().await;
        let mut stream = client
            .open_stream(Request::PushUpdate {
                version: "1.0.1".into(),
                total_size: 4,
                sha256_hex: None,
            })
            .await
            .unwrap();

        stream
            .send_item(StreamItem::UpdateChunk { data_hex: hex::encode([1u8, 2, 3, 4]) })
            .await
            .unwrap();
        stream.finish_sending().await.unwrap();

        loop {
            match stream.next().await.unwrap() {
                StreamEvent::Response(result) => {
                    match result.unwrap() {
                        Response::PushUpdateAck { success, message } => {
                            assert!(success);
                            assert_eq!(message, "4 bytes");
                        }
                        other => panic!("unexpected response {other:?}"),
                    }
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_unary_calls_multiplex() {
        let (client, _server) = pipe_pair().await;
        let client = Arc::new(client);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client
                    .call(Request::Heartbeat { agent_version: "1".into() }, Duration::from_secs(5))
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }
}
