//! Tunnel session: one WebSocket, a single reader task, a serialized writer.
//!
//! [`Session::dial`] owns the connecting side (client role) over
//! tokio-tungstenite; [`Session::accept`] wraps an upgraded axum socket
//! (server role). Both are adapted into boxed stream/sink halves so the rest
//! of the session is transport-agnostic.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{
    message_id, split, Envelope, Frame, Message, PingEnvelope, Reassembler, Topic,
};
use crate::router::{Status, TopicRouter, SUBSCRIBER_BUFFER};

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Payloads above this size are split across frames.
    pub chunk_size: usize,
    /// Application-level keepalive period; `None` disables the ping task and
    /// the idle cutoff. No inbound frame for twice this long closes the
    /// session.
    pub ping_interval: Option<Duration>,
    /// Sent as the `Authorization` header when dialing.
    pub auth_secret: Option<String>,
    pub dial_attempts: u32,
    pub dial_backoff: Duration,
    pub reassembly_stale_after: Duration,
    pub subscriber_buffer: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            chunk_size: 1024,
            ping_interval: Some(Duration::from_secs(30)),
            auth_secret: None,
            dial_attempts: 3,
            dial_backoff: Duration::from_secs(1),
            reassembly_stale_after: Duration::from_secs(60),
            subscriber_buffer: SUBSCRIBER_BUFFER,
        }
    }
}

/// Socket frames after the transport-specific message type is erased.
enum SocketFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close,
    Other,
}

type FrameSink = Pin<Box<dyn Sink<SocketFrame, Error = Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<SocketFrame>> + Send>>;

fn to_tungstenite(frame: SocketFrame) -> WsMessage {
    match frame {
        SocketFrame::Text(text) => WsMessage::Text(text.into()),
        SocketFrame::Binary(data) => WsMessage::Binary(data.into()),
        SocketFrame::Ping(data) => WsMessage::Ping(data.into()),
        SocketFrame::Pong => WsMessage::Pong(Vec::new().into()),
        SocketFrame::Close | SocketFrame::Other => WsMessage::Close(None),
    }
}

fn from_tungstenite(message: WsMessage) -> SocketFrame {
    match message {
        WsMessage::Text(text) => SocketFrame::Text(text.to_string()),
        WsMessage::Binary(data) => SocketFrame::Binary(data.to_vec()),
        WsMessage::Ping(data) => SocketFrame::Ping(data.to_vec()),
        WsMessage::Pong(_) => SocketFrame::Pong,
        WsMessage::Close(_) => SocketFrame::Close,
        WsMessage::Frame(_) => SocketFrame::Other,
    }
}

fn to_axum(frame: SocketFrame) -> AxumMessage {
    match frame {
        SocketFrame::Text(text) => AxumMessage::Text(text.into()),
        SocketFrame::Binary(data) => AxumMessage::Binary(data.into()),
        SocketFrame::Ping(data) => AxumMessage::Ping(data.into()),
        SocketFrame::Pong => AxumMessage::Pong(Vec::new().into()),
        SocketFrame::Close | SocketFrame::Other => AxumMessage::Close(None),
    }
}

fn from_axum(message: AxumMessage) -> SocketFrame {
    match message {
        AxumMessage::Text(text) => SocketFrame::Text(text.to_string()),
        AxumMessage::Binary(data) => SocketFrame::Binary(data.to_vec()),
        AxumMessage::Ping(data) => SocketFrame::Ping(data.to_vec()),
        AxumMessage::Pong(_) => SocketFrame::Pong,
        AxumMessage::Close(_) => SocketFrame::Close,
    }
}

fn wrap_tungstenite<S>(socket: WebSocketStream<S>) -> (FrameSink, FrameStream)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    let sink = Box::pin(
        sink.sink_map_err(Error::from)
            .with(|frame: SocketFrame| futures_util::future::ready(Ok::<_, Error>(to_tungstenite(frame)))),
    );
    let stream = Box::pin(stream.map(|item| item.map(from_tungstenite).map_err(Error::from)));
    (sink, stream)
}

fn wrap_axum(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (sink, stream) = socket.split();
    let sink = Box::pin(
        sink.sink_map_err(Error::from)
            .with(|frame: SocketFrame| futures_util::future::ready(Ok::<_, Error>(to_axum(frame)))),
    );
    let stream = Box::pin(stream.map(|item| item.map(from_axum).map_err(Error::from)));
    (sink, stream)
}

struct SessionInner {
    writer: Mutex<FrameSink>,
    router: TopicRouter,
    chunk_size: usize,
    closed: AtomicBool,
    shutdown: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a live tunnel session. Cheap to clone; the last clone dropping
/// does not close the socket — call [`Session::close`] for that.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open a WebSocket to `url`, retrying with a fixed backoff.
    pub async fn dial(url: &str, options: SessionOptions) -> Result<Session> {
        let attempts = options.dial_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            let request = client_request(url, options.auth_secret.as_deref())?;
            match connect_async(request).await {
                Ok((socket, _)) => {
                    info!(url, "websocket connected");
                    let (sink, stream) = wrap_tungstenite(socket);
                    return Ok(Session::from_parts(sink, stream, &options));
                }
                Err(err) => {
                    warn!(url, attempt, max = attempts, error = %err, "websocket dial failed");
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(options.dial_backoff).await;
                    }
                }
            }
        }
        Err(Error::Dial {
            url: url.to_string(),
            attempts,
            source: Box::new(last_err.expect("at least one attempt was made")),
        })
    }

    /// Adopt an upgraded server-side socket.
    pub fn accept(socket: WebSocket, options: &SessionOptions) -> Session {
        let (sink, stream) = wrap_axum(socket);
        Session::from_parts(sink, stream, options)
    }

    fn from_parts(sink: FrameSink, stream: FrameStream, options: &SessionOptions) -> Session {
        let inner = Arc::new(SessionInner {
            writer: Mutex::new(sink),
            router: TopicRouter::new(options.subscriber_buffer),
            chunk_size: options.chunk_size,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            reader: Mutex::new(None),
        });
        let session = Session {
            inner: inner.clone(),
        };
        inner.router.emit_status(Status::Connected);

        // Subscribe the built-in consumers before the reader can publish.
        let pings = inner.router.subscribe(Topic::Ping);
        let errors = inner.router.subscribe(Topic::Error);

        let reader = tokio::spawn(read_loop(
            inner.clone(),
            stream,
            options.reassembly_stale_after,
            options.ping_interval.map(|p| p * 2),
        ));
        *inner
            .reader
            .try_lock()
            .expect("reader slot of a fresh session")
            = Some(reader);

        if let Some(every) = options.ping_interval {
            tokio::spawn(ping_loop(session.clone(), every));
        }
        tokio::spawn(ping_responder(session.clone(), pings));
        tokio::spawn(error_listener(errors));

        session
    }

    /// Send a message under a fresh id; returns the id.
    pub async fn send(&self, topic: Topic, payload: &[u8]) -> Result<String> {
        let id = message_id();
        self.send_with_id(&id, topic, payload).await?;
        Ok(id)
    }

    /// Send a message under the caller's id (responses reuse the request id).
    /// The writer lock is held across every chunk so concurrent senders
    /// cannot interleave chunks of different messages.
    pub async fn send_with_id(&self, id: &str, topic: Topic, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let frames = split(id, topic, payload, self.inner.chunk_size);
        let mut writer = self.inner.writer.lock().await;
        for frame in &frames {
            let text = frame.encode()?;
            if let Err(err) = writer.feed(SocketFrame::Text(text)).await {
                return Err(self.fail_write(err));
            }
        }
        writer.flush().await.map_err(|err| self.fail_write(err))
    }

    /// A failed write marks the session disconnected for future senders but
    /// leaves the reader to observe the closed socket on its own.
    fn fail_write(&self, err: Error) -> Error {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.router.emit_status(Status::Disconnected);
        err
    }

    pub fn subscribe(&self, topic: Topic) -> mpsc::Receiver<Message> {
        self.inner.router.subscribe(topic)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<Status> {
        self.inner.router.subscribe_status()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the socket, wait for the reader to exit, and end every
    /// subscription. Idempotent.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.send(SocketFrame::Close).await;
            let _ = writer.close().await;
        }
        if let Some(handle) = self.inner.reader.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn read_loop(
    inner: Arc<SessionInner>,
    mut stream: FrameStream,
    stale_after: Duration,
    idle_after: Option<Duration>,
) {
    let mut reassembler = Reassembler::new(stale_after);
    let mut sweep = interval((stale_after / 2).max(Duration::from_millis(100)));
    // The idle deadline only advances on inbound frames.
    let mut last_inbound = tokio::time::Instant::now();

    loop {
        let idle_deadline = idle_after.map(|limit| last_inbound + limit);
        let idle_cutoff = async move {
            match idle_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = sweep.tick() => {
                reassembler.prune_stale(Instant::now());
            }
            _ = idle_cutoff => {
                warn!("no inbound frames within the liveness window, closing session");
                inner
                    .router
                    .emit_status(Status::Error("liveness timeout".to_string()));
                break;
            }
            item = stream.next() => {
                last_inbound = tokio::time::Instant::now();
                match item {
                    None => {
                        debug!("websocket stream ended");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket read failed");
                        inner.router.emit_status(Status::Error(err.to_string()));
                        break;
                    }
                    Some(Ok(SocketFrame::Text(text))) => {
                        if handle_frame(&inner, &mut reassembler, &text).is_break() {
                            break;
                        }
                    }
                    Some(Ok(SocketFrame::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if handle_frame(&inner, &mut reassembler, &text).is_break() {
                                break;
                            }
                        }
                        Err(_) => warn!("ignoring non-utf8 binary frame"),
                    },
                    Some(Ok(SocketFrame::Close)) => {
                        debug!("peer closed the websocket");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    inner.closed.store(true, Ordering::SeqCst);
    inner.shutdown.cancel();
    inner.router.emit_status(Status::Disconnected);
    inner.router.close();
}

fn handle_frame(
    inner: &SessionInner,
    reassembler: &mut Reassembler,
    text: &str,
) -> ControlFlow<()> {
    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(err) => {
            // Malformed frame JSON is fatal; envelope-level problems are not.
            error!(error = %err, "failed to decode frame, closing session");
            inner
                .router
                .emit_status(Status::Error(format!("frame decode failed: {err}")));
            return ControlFlow::Break(());
        }
    };
    match reassembler.accept(frame) {
        Ok(Some(message)) => {
            if message.topic == Topic::Unknown {
                warn!(id = %message.id, "dropping message with unknown topic");
            } else {
                inner.router.publish(message);
            }
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "dropping inconsistent chunk"),
    }
    ControlFlow::Continue(())
}

fn client_request(url: &str, secret: Option<&str>) -> Result<http::Request<()>> {
    let parsed = Url::parse(url)
        .map_err(|err| Error::Config(format!("invalid websocket url '{url}': {err}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Config(format!("websocket url '{url}' has no host")))?;
    let host = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut request = http::Request::builder()
        .uri(url)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());
    if let Some(secret) = secret {
        request = request.header("Authorization", secret);
    }
    request
        .body(())
        .map_err(|err| Error::Config(format!("failed to build upgrade request: {err}")))
}

/// Periodic application-level keepalive. The first ping goes out right after
/// connecting, which doubles as the hello to the peer.
async fn ping_loop(session: Session, every: Duration) {
    let mut ticker = interval(every);
    loop {
        tokio::select! {
            _ = session.inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Ok(payload) = (PingEnvelope { body: "ping".to_string() }).to_payload() else {
                    break;
                };
                if let Err(err) = session.send(Topic::Ping, &payload).await {
                    debug!(error = %err, "ping failed, stopping keepalive");
                    break;
                }
            }
        }
    }
}

/// Answers the peer's `"ping"` with a `"pong"` under the same id.
async fn ping_responder(session: Session, mut pings: mpsc::Receiver<Message>) {
    while let Some(message) = pings.recv().await {
        let envelope = match Envelope::decode(Topic::Ping, &message.payload) {
            Ok(Envelope::Ping(envelope)) => envelope,
            _ => {
                warn!(id = %message.id, "undecodable ping payload");
                continue;
            }
        };
        if envelope.body != "ping" {
            debug!(id = %message.id, "pong received");
            continue;
        }
        let Ok(payload) = (PingEnvelope { body: "pong".to_string() }).to_payload() else {
            continue;
        };
        if session
            .send_with_id(&message.id, Topic::Ping, &payload)
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Logs `error` topic messages from the peer.
async fn error_listener(mut errors: mpsc::Receiver<Message>) {
    while let Some(message) = errors.recv().await {
        match Envelope::decode(Topic::Error, &message.payload) {
            Ok(Envelope::Error(envelope)) => {
                warn!(code = envelope.code, message = %envelope.message, "peer reported an error");
            }
            _ => warn!(id = %message.id, "undecodable error payload from peer"),
        }
    }
}
