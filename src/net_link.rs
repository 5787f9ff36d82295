use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;
use uuid::Uuid;

use crate::audio::{AudioChunk, BinaryFormat, OutboundMedia, Playback};
use crate::config::Config;
use crate::error::CallError;
use crate::protocol::{self, Inbound};

/// How long `disconnect` waits for the close handshake before aborting.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Keep-alive periods without any inbound frame before the link is declared dead.
const PONG_GRACE_PERIODS: u32 = 2;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    Connected,
    /// Remote side closed the connection
    Disconnected,
    /// Connection broke after it was established
    Failed(String),
    StreamStarted(Option<String>),
    StreamStopped,
    /// Microphone failed mid-call and could not be recovered
    CaptureLost(String),
}

/// A `NetEvent` tagged with the session whose link produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub session: Uuid,
    pub event: NetEvent,
}

#[derive(Debug)]
enum NetCommand {
    SendText(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct NetLinkOptions {
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub outbound_queue: usize,
    pub binary_format: BinaryFormat,
    pub token: Option<String>,
}

impl NetLinkOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            keepalive: config.keepalive_interval(),
            outbound_queue: config.outbound_queue,
            binary_format: config.binary_format,
            token: config.token().map(str::to_string),
        }
    }
}

struct Shared {
    state: Mutex<ConnectionState>,
    /// Present only while a live connection exists
    outbound: Mutex<Option<mpsc::Sender<NetCommand>>>,
    stream_sid: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != state {
            log::debug!("Connection state: {:?} -> {:?}", *current, state);
            *current = state;
        }
    }
}

/// Everything the connection task needs.
struct LinkContext {
    session: Uuid,
    shared: Arc<Shared>,
    playback: Arc<Playback>,
    events: mpsc::Sender<LinkEvent>,
    keepalive: Duration,
    binary_format: BinaryFormat,
}

impl LinkContext {
    fn emit(&self, event: NetEvent) {
        let event = LinkEvent {
            session: self.session,
            event,
        };
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Dropping link event: {}", e);
        }
    }
}

/// One streaming connection to the media server.
///
/// Outbound text goes through a bounded queue drained by the connection
/// task; inbound audio is handed to the playback stage. Nothing here
/// reconnects on its own.
pub struct NetLink {
    session: Uuid,
    options: NetLinkOptions,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    playback: Arc<Playback>,
    events: mpsc::Sender<LinkEvent>,
}

impl NetLink {
    pub fn new(
        session: Uuid,
        options: NetLinkOptions,
        playback: Arc<Playback>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            session,
            options,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                stream_sid: Mutex::new(None),
            }),
            task: Mutex::new(None),
            playback,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Open the connection and wait until the handshake completes, fails,
    /// or the connect timeout elapses.
    pub async fn connect(&self, url: &str) -> Result<(), CallError> {
        if self.task.lock().is_some() {
            return Err(CallError::ConnectionFailure("link already in use".into()));
        }
        self.shared.set_state(ConnectionState::Connecting);

        let request = match build_request(url, self.options.token.as_deref()) {
            Ok(request) => request,
            Err(reason) => return Err(self.fail_connect(reason)),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel::<NetCommand>(self.options.outbound_queue.max(1));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let ctx = LinkContext {
            session: self.session,
            shared: self.shared.clone(),
            playback: self.playback.clone(),
            events: self.events.clone(),
            keepalive: self.options.keepalive,
            binary_format: self.options.binary_format,
        };

        let task = tokio::spawn(run_connection(request, ctx, cmd_tx, cmd_rx, ready_tx));
        *self.task.lock() = Some(task);

        match tokio::time::timeout(self.options.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                log::info!("Connected to {}", url);
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(self.fail_connect(reason)),
            Ok(Err(_)) => Err(self.fail_connect("connection task ended before handshake".into())),
            Err(_) => Err(self.fail_connect(format!(
                "no handshake within {:?}",
                self.options.connect_timeout
            ))),
        }
    }

    fn fail_connect(&self, reason: String) -> CallError {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.shared.outbound.lock().take();
        self.shared.set_state(ConnectionState::Failed);
        log::error!("Connect failed: {}", reason);
        self.emit(NetEvent::Failed(reason.clone()));
        CallError::ConnectionFailure(reason)
    }

    fn emit(&self, event: NetEvent) {
        let event = LinkEvent {
            session: self.session,
            event,
        };
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Dropping link event: {}", e);
        }
    }

    /// Whether a live connection handle exists. The next send may still fail.
    pub fn is_connected(&self) -> bool {
        self.shared.outbound.lock().is_some() && self.shared.state() == ConnectionState::Connected
    }

    /// Queue a text frame without blocking.
    pub fn try_send(&self, text: String) -> Result<(), CallError> {
        let outbound = self.shared.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(CallError::NotConnected);
        };
        // Full queue, or the connection task is already winding down
        tx.try_send(NetCommand::SendText(text))
            .map_err(|_| CallError::WriteBackpressure)
    }

    /// Best-effort send: failures are logged, never returned.
    pub fn send(&self, text: String) {
        if let Err(e) = self.try_send(text) {
            log::warn!("Outbound frame dropped: {}", e);
        }
    }

    pub fn stream_sid(&self) -> Option<String> {
        self.shared.stream_sid.lock().clone()
    }

    /// Stop playback, close with a normal-closure frame, drop the handle.
    ///
    /// Safe to call repeatedly or on a link that never connected.
    pub async fn disconnect(&self) {
        self.playback.stop();

        let outbound = self.shared.outbound.lock().take();
        let task = self.task.lock().take();
        if outbound.is_none() && task.is_none() {
            self.shared.set_state(ConnectionState::Disconnected);
            return;
        }

        self.shared.set_state(ConnectionState::Closing);
        if let Some(tx) = outbound {
            if tokio::time::timeout(CLOSE_GRACE, tx.send(NetCommand::Close))
                .await
                .map_or(true, |r| r.is_err())
            {
                log::warn!("Could not queue close frame");
            }
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                log::warn!("Connection task did not finish in {:?}, aborting", CLOSE_GRACE);
                task.abort();
            }
        }

        self.shared.stream_sid.lock().take();
        self.shared.set_state(ConnectionState::Disconnected);
        log::info!("Disconnected");
    }
}

impl OutboundMedia for NetLink {
    fn is_connected(&self) -> bool {
        NetLink::is_connected(self)
    }

    fn send(&self, text: String) {
        NetLink::send(self, text)
    }

    fn stream_sid(&self) -> Option<String> {
        NetLink::stream_sid(self)
    }

    fn capture_lost(&self, reason: String) {
        self.emit(NetEvent::CaptureLost(reason));
    }
}

impl Drop for NetLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

fn build_request(url: &str, token: Option<&str>) -> Result<Request, String> {
    let parsed = Url::parse(url).map_err(|e| format!("invalid url '{}': {}", url, e))?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => return Err(format!("unsupported scheme '{}'", other)),
    }

    let mut request = parsed
        .as_str()
        .into_client_request()
        .map_err(|e| format!("bad request for '{}': {}", url, e))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| format!("bad token: {}", e))?;
        request.headers_mut().insert("Authorization", value);
    }
    Ok(request)
}

async fn run_connection(
    request: Request,
    ctx: LinkContext,
    cmd_tx: mpsc::Sender<NetCommand>,
    mut cmd_rx: mpsc::Receiver<NetCommand>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    log::info!("Connecting to {}...", request.uri());
    let ws_stream = match connect_async(request).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    // Publish the handle before anyone is told we are up
    *ctx.shared.outbound.lock() = Some(cmd_tx);
    ctx.shared.set_state(ConnectionState::Connected);
    if ready.send(Ok(())).is_err() {
        ctx.shared.outbound.lock().take();
        return;
    }
    ctx.emit(NetEvent::Connected);

    let result = stream_loop(ws_stream, &ctx, &mut cmd_rx).await;

    ctx.shared.outbound.lock().take();
    let closing = ctx.shared.state() == ConnectionState::Closing;
    match result {
        Ok(()) => {
            log::info!("Connection closed");
            if !closing {
                ctx.shared.set_state(ConnectionState::Disconnected);
                ctx.emit(NetEvent::Disconnected);
            }
        }
        Err(e) => {
            log::error!("Connection error: {:#}", e);
            if !closing {
                ctx.shared.set_state(ConnectionState::Failed);
                ctx.emit(NetEvent::Failed(e.to_string()));
            }
        }
    }
}

async fn stream_loop(
    ws_stream: WsStream,
    ctx: &LinkContext,
    cmd_rx: &mut mpsc::Receiver<NetCommand>,
) -> anyhow::Result<()> {
    let (mut write, mut read) = ws_stream.split();

    let period = ctx.keepalive.max(Duration::from_secs(1));
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    // Any inbound frame proves the peer is alive, pongs included
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                if let Some(Ok(_)) = &msg {
                    last_heard = Instant::now();
                }
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch_text(text.as_str(), ctx),
                    Some(Ok(Message::Binary(data))) => {
                        ctx.playback.enqueue(ctx.binary_format.tag(data.to_vec()));
                    }
                    Some(Ok(Message::Pong(_))) => log::trace!("Keep-alive pong received"),
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(anyhow::anyhow!("Connection closed without close frame")),
                }
            }
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    NetCommand::SendText(text) => {
                        // A peer that stopped reading stalls the write; that is a dead link
                        match tokio::time::timeout(period, write.send(Message::Text(text.into()))).await {
                            Ok(Ok(())) => {}
                            // A rejected write drops the frame, the link stays up
                            Ok(Err(e)) => log::warn!("Outbound frame rejected: {}", e),
                            Err(_) => anyhow::bail!("Outbound write stalled for {:?}", period),
                        }
                    }
                    NetCommand::Close => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "call ended".to_string().into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            log::warn!("Failed to send close frame: {}", e);
                        }
                        return Ok(());
                    }
                }
            }
            _ = keepalive.tick() => {
                let silent_for = last_heard.elapsed();
                if silent_for > period * PONG_GRACE_PERIODS {
                    anyhow::bail!("No response from server for {:?}", silent_for);
                }
                log::debug!("Sending keep-alive ping");
                tokio::time::timeout(period, write.send(Message::Ping(Bytes::new())))
                    .await
                    .map_err(|_| anyhow::anyhow!("Keep-alive ping stalled for {:?}", period))??;
            }
        }
    }
}

fn dispatch_text(text: &str, ctx: &LinkContext) {
    match protocol::parse_inbound(text) {
        Ok(Inbound::Media(ulaw)) => ctx.playback.enqueue(AudioChunk::Compressed(ulaw)),
        Ok(Inbound::Start { stream_sid }) => {
            log::info!("Media stream started: {:?}", stream_sid);
            *ctx.shared.stream_sid.lock() = stream_sid.clone();
            ctx.emit(NetEvent::StreamStarted(stream_sid));
        }
        Ok(Inbound::Stop) => {
            log::info!("Media stream stopped by remote");
            ctx.emit(NetEvent::StreamStopped);
        }
        Ok(Inbound::Clear) => {
            log::debug!("Clear requested, flushing playback");
            ctx.playback.flush();
        }
        Ok(Inbound::Mark(name)) => log::debug!("Mark received: {}", name),
        Ok(Inbound::Connected) => log::info!("Media server acknowledged connection"),
        Ok(Inbound::Other(event)) => log::info!("Ignoring unrecognized event: {}", event),
        Err(e) => log::warn!("Dropping inbound frame: {}", e),
    }
}
