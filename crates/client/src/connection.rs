//! Connection manager for the chat session channel
//!
//! A single background task owns the WebSocket together with the outbound
//! queue, heartbeat monitor, reconnector and stream buffers. The public
//! [`ConnectionManager`] handle forwards calls to that task over a command
//! channel, so every state change happens on one task in call order and no
//! network failure is ever returned to the caller: failures are published as
//! events instead.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chatlink_common::{
    parse_frame, CloseInfo, ConnectionInfo, ConnectionState, InboundFrame, OutboundFrame,
    CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NO_STATUS,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, ErrorEvent, EventBus, EventKind, HandlerId};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatStatus};
use crate::queue::MessageQueue;
use crate::reconnect::Reconnector;
use crate::stream::StreamAggregator;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = BoxFuture<'static, std::result::Result<WsStream, WsError>>;

/// Upper bound on waiting for our close frame to be written.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

const DISCONNECT_REASON: &str = "Client disconnect";

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Send(OutboundFrame),
}

/// Handle to the chat connection. Dropping it closes the connection cleanly
/// and discards anything still queued.
pub struct ConnectionManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    info_rx: watch::Receiver<ConnectionInfo>,
    events: Arc<EventBus>,
    _task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawn the connection task. Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_events(config, Arc::new(EventBus::new()))
    }

    /// Like [`new`](Self::new), with subscribers already attached to `events`
    /// so they also observe the initial auto-connect.
    pub fn with_events(config: ClientConfig, events: Arc<EventBus>) -> Result<Self> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (info_tx, info_rx) = watch::channel(ConnectionInfo::default());
        let task = ConnectionTask::new(&config, cmd_rx, info_tx, Arc::clone(&events))?;
        let handle = tokio::spawn(task.run());

        let manager = Self {
            cmd_tx,
            info_rx,
            events,
            _task: handle,
        };

        if config.connection.auto_connect {
            manager.connect()?;
        }

        Ok(manager)
    }

    /// Start connecting. A no-op while already open or connecting.
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Close cleanly and stop any reconnection. Safe to call in any state.
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    /// Send a chat message, queueing it while the connection is down.
    /// Returns the message id (generated when `message_id` is `None`).
    pub fn send_message(
        &self,
        content: impl Into<String>,
        message_id: Option<String>,
    ) -> Result<String> {
        let message_id = message_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.command(Command::Send(OutboundFrame::Message {
            content: content.into(),
            message_id: message_id.clone(),
            timestamp: Utc::now(),
        }))?;
        Ok(message_id)
    }

    pub fn send_typing(&self, is_typing: bool) -> Result<()> {
        self.command(Command::Send(OutboundFrame::Typing { is_typing }))
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info_rx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.info_rx.borrow().status
    }

    /// Receiver that observes every published [`ConnectionInfo`].
    pub fn watch_info(&self) -> watch::Receiver<ConnectionInfo> {
        self.info_rx.clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.events.off(kind, id)
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| ClientError::Closed)
    }
}

struct ConnectionTask {
    url: String,
    redacted_url: String,
    auto_reconnect: bool,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    info_tx: watch::Sender<ConnectionInfo>,
    info: ConnectionInfo,
    events: Arc<EventBus>,
    socket: Option<WsStream>,
    pending_connect: Option<ConnectFuture>,
    queue: MessageQueue,
    heartbeat: HeartbeatMonitor,
    reconnector: Reconnector,
    streams: StreamAggregator,
}

impl ConnectionTask {
    fn new(
        config: &ClientConfig,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        info_tx: watch::Sender<ConnectionInfo>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        Ok(Self {
            url: config.connection.chat_url()?,
            redacted_url: config.connection.redacted_url(),
            auto_reconnect: config.connection.auto_reconnect,
            cmd_rx,
            info_tx,
            info: ConnectionInfo::default(),
            events,
            socket: None,
            pending_connect: None,
            queue: MessageQueue::new(config.queue.capacity),
            heartbeat: HeartbeatMonitor::new(
                config.heartbeat.interval(),
                config.heartbeat.max_missed,
            ),
            reconnector: Reconnector::new(
                config.reconnect.base_delay(),
                config.reconnect.max_delay(),
                config.reconnect.max_attempts,
            ),
            streams: StreamAggregator::new(),
        })
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Connect) => self.connect(),
                    Some(Command::Disconnect) => self.disconnect().await,
                    Some(Command::Send(frame)) => self.send(frame).await,
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },

                result = poll_connect(&mut self.pending_connect) => {
                    self.pending_connect = None;
                    match result {
                        Ok(socket) => self.on_open(socket).await,
                        Err(err) => self.on_connect_failed(err),
                    }
                }

                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,

                () = self.heartbeat.tick() => self.on_heartbeat_tick().await,

                () = self.reconnector.wait() => self.on_reconnect_timer(),
            }
        }

        debug!(queued = self.queue.len(), "Connection task stopped");
    }

    fn connect(&mut self) {
        match self.info.status {
            ConnectionState::Open | ConnectionState::Connecting => {
                debug!(state = %self.info.status, "Connect ignored");
                return;
            }
            ConnectionState::Reconnecting => {
                self.reconnector.cancel();
            }
            ConnectionState::Idle | ConnectionState::Closing => {}
        }
        self.begin_connect();
    }

    fn begin_connect(&mut self) {
        info!(
            url = %self.redacted_url,
            attempt = self.reconnector.attempts(),
            "Connecting to chat service"
        );
        self.pending_connect = Some(
            connect_async(self.url.clone())
                .map(|result| result.map(|(socket, _response)| socket))
                .boxed(),
        );
        self.set_status(ConnectionState::Connecting);
    }

    async fn on_open(&mut self, socket: WsStream) {
        self.socket = Some(socket);
        self.reconnector.reset();
        self.info.reconnect_attempts = 0;
        self.info.last_connected_at = Some(Utc::now());
        self.set_status(ConnectionState::Open);
        info!(url = %self.redacted_url, "Connected to chat service");

        self.events.emit(&ClientEvent::Connected(self.info.clone()));
        self.heartbeat.start();
        self.flush_queue().await;
    }

    fn on_connect_failed(&mut self, err: WsError) {
        let err = ClientError::from(err);
        warn!(error = %err, "Connection attempt failed");
        self.publish_error(&err);

        if self.auto_reconnect {
            self.schedule_reconnect();
        } else {
            self.set_status(ConnectionState::Idle);
        }
    }

    /// Transmit now if open, otherwise queue for the next open.
    async fn send(&mut self, frame: OutboundFrame) {
        if !self.info.is_open() {
            self.enqueue(frame);
            return;
        }

        if let Err(err) = self.transmit(&frame).await {
            warn!(kind = frame.kind(), error = %err, "Send failed, queueing frame");
            self.enqueue(frame);
            self.publish_error(&err);
            self.on_closed(CloseInfo::abnormal(err.to_string()));
        }
    }

    fn enqueue(&mut self, frame: OutboundFrame) {
        let kind = frame.kind();
        if self.queue.enqueue(frame).is_ok() {
            debug!(kind, queued = self.queue.len(), "Frame queued until connection opens");
        }
    }

    async fn transmit(&mut self, frame: &OutboundFrame) -> Result<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(ClientError::Transport("not connected".to_string()));
        };
        let text = frame.to_json()?;
        socket.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let mut frames = self.queue.drain().into_iter();
        info!(count = frames.len(), "Flushing queued frames");

        while let Some(queued) = frames.next() {
            if let Err(err) = self.transmit(&queued.frame).await {
                warn!(seq = queued.seq, error = %err, "Flush interrupted, requeueing");
                let mut unsent = vec![queued];
                unsent.extend(frames);
                self.queue.requeue_front(unsent);
                self.publish_error(&err);
                self.on_closed(CloseInfo::abnormal(err.to_string()));
                return;
            }
        }
    }

    async fn on_frame(&mut self, frame: Option<std::result::Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.on_text(&text),
            Some(Ok(Message::Binary(data))) => {
                debug!(len = data.len(), "Ignoring binary frame");
            }
            // Pongs are queued by tungstenite and go out with the next read.
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                let close = match frame {
                    Some(frame) => CloseInfo::from_peer(u16::from(frame.code), frame.reason.as_str()),
                    None => CloseInfo::new(CLOSE_NO_STATUS, "Server closed connection", false),
                };
                // Tungstenite has only queued the close reply; write it out
                // before the socket is dropped.
                if let Some(mut socket) = self.socket.take() {
                    close_socket(&mut socket, None).await;
                }
                self.on_closed(close);
            }
            Some(Err(err)) => {
                let err = ClientError::from(err);
                self.publish_error(&err);
                self.on_closed(CloseInfo::abnormal(err.to_string()));
            }
            None => self.on_closed(CloseInfo::abnormal("Connection stream ended")),
        }
    }

    /// Parse and route one inbound frame. Malformed frames are dropped.
    fn on_text(&mut self, text: &str) {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(err) => {
                let err = ClientError::from(err);
                warn!(error = %err, len = text.len(), "Discarding inbound frame");
                return;
            }
        };

        let event = match frame {
            InboundFrame::HeartbeatAck => {
                self.heartbeat.acknowledge();
                return;
            }
            InboundFrame::StreamStart { message_id, .. } => self.streams.start(message_id),
            InboundFrame::StreamToken { message_id, token, .. } => {
                self.streams.token(message_id, token)
            }
            InboundFrame::StreamEnd { message_id, full_response, .. } => {
                self.streams.end(message_id, full_response)
            }
            InboundFrame::StreamError { message_id, error, .. } => {
                let err = ClientError::Stream {
                    message_id: message_id.clone(),
                    error: error.to_string(),
                };
                warn!(error = %err, "Stream failed");
                self.streams.fail(message_id, error)
            }
            InboundFrame::ConnectionEstablished(payload) => {
                ClientEvent::ConnectionEstablished(payload)
            }
            InboundFrame::MessageReceived(payload) => ClientEvent::MessageAck(payload),
            InboundFrame::Error(payload) => {
                warn!(payload = %payload, "Service reported an error");
                ClientEvent::Error(ErrorEvent::Server(payload))
            }
            InboundFrame::Broadcast(payload) => ClientEvent::Broadcast(payload),
            InboundFrame::Other { kind, payload } => {
                debug!(%kind, "Unrecognized frame type");
                ClientEvent::Message { kind, payload }
            }
        };

        self.events.emit(&event);
    }

    async fn on_heartbeat_tick(&mut self) {
        self.send(OutboundFrame::Heartbeat).await;
        // The send itself may have found the connection dead.
        if !self.heartbeat.is_running() {
            return;
        }

        match self.heartbeat.record_probe() {
            HeartbeatStatus::Alive { missed } => {
                debug!(missed, "Heartbeat sent");
            }
            HeartbeatStatus::TimedOut { missed } => {
                let err = ClientError::HeartbeatTimeout { missed };
                warn!(error = %err, "Forcing connection closed");
                self.publish_error(&err);

                if let Some(mut socket) = self.socket.take() {
                    let frame = CloseFrame {
                        code: CloseCode::from(CLOSE_HEARTBEAT_TIMEOUT),
                        reason: "Heartbeat timeout".into(),
                    };
                    close_socket(&mut socket, Some(frame)).await;
                }
                self.on_closed(CloseInfo::new(CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout", false));
            }
        }
    }

    fn on_reconnect_timer(&mut self) {
        let attempts = self.reconnector.fire();
        self.info.reconnect_attempts = attempts;
        self.begin_connect();
    }

    /// Tear down after the connection ended for any reason other than
    /// an explicit disconnect.
    fn on_closed(&mut self, close: CloseInfo) {
        self.heartbeat.stop();
        self.socket = None;

        let discarded = self.streams.clear();
        if discarded > 0 {
            debug!(discarded, "Discarded unfinished streams");
        }

        if close.was_clean {
            info!(%close, "Connection closed by server");
        } else {
            warn!(%close, "Connection lost");
        }
        self.events.emit(&ClientEvent::Disconnected(close.clone()));

        if close.was_clean || !self.auto_reconnect {
            self.set_status(ConnectionState::Idle);
        } else {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnector.is_exhausted() {
            let err = ClientError::ReconnectExhausted {
                attempts: self.reconnector.attempts(),
            };
            error!(error = %err, "Giving up on the connection");
            self.publish_error(&err);
            self.set_status(ConnectionState::Idle);
            return;
        }

        let delay = self.reconnector.schedule();
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.reconnector.attempts() + 1,
            "Reconnect scheduled"
        );
        self.set_status(ConnectionState::Reconnecting);
    }

    async fn disconnect(&mut self) {
        let cancelled_reconnect = self.reconnector.cancel();
        let aborted_connect = self.pending_connect.take().is_some();
        self.heartbeat.stop();

        if self.info.status == ConnectionState::Idle {
            debug!("Already disconnected");
            return;
        }

        self.set_status(ConnectionState::Closing);
        if let Some(mut socket) = self.socket.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: DISCONNECT_REASON.into(),
            };
            close_socket(&mut socket, Some(frame)).await;
            self.streams.clear();
            self.events.emit(&ClientEvent::Disconnected(CloseInfo::normal(DISCONNECT_REASON)));
        }

        info!(cancelled_reconnect, aborted_connect, "Disconnected from chat service");
        self.set_status(ConnectionState::Idle);
    }

    fn publish_error(&self, err: &ClientError) {
        self.events.emit(&ClientEvent::Error(ErrorEvent::Client {
            message: err.to_string(),
            recoverable: self.auto_reconnect && err.is_recoverable(),
        }));
    }

    fn set_status(&mut self, status: ConnectionState) {
        debug!(from = %self.info.status, to = %status, "Connection state change");
        self.info.status = status;
        self.info_tx.send_replace(self.info.clone());
        self.events.emit(&ClientEvent::StateChange(self.info.clone()));
    }
}

/// With no frame this only flushes a close reply tungstenite already queued.
async fn close_socket(socket: &mut WsStream, frame: Option<CloseFrame>) {
    match tokio::time::timeout(CLOSE_TIMEOUT, socket.close(frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "Close frame not delivered"),
        Err(_) => debug!("Timed out sending close frame"),
    }
}

async fn poll_connect(
    pending_connect: &mut Option<ConnectFuture>,
) -> std::result::Result<WsStream, WsError> {
    match pending_connect {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<std::result::Result<Message, WsError>> {
    match socket {
        Some(socket) => socket.next().await,
        None => pending().await,
    }
}
