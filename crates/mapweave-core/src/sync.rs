//! Channel protocol between sessions and the relay server, and a native
//! WebSocket client for it.

use crate::delta::Delta;
use crate::id::{SessionId, SpaceId, UserId};
use crate::service::{Ack, Mutation, MutationError, SpaceContents};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a space, leaving any previous one.
    Join { space: SpaceId, user: UserId, session: SessionId },
    Leave,
    /// Load the full contents of the joined space.
    Fetch { request_id: u64 },
    Request { request_id: u64, mutation: Mutation },
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined { space: SpaceId, peer_count: usize },
    Ack { request_id: u64, ack: Ack },
    Contents { request_id: u64, contents: SpaceContents },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        error: MutationError,
        message: String,
    },
    Delta { space: SpaceId, delta: Delta },
}

impl ServerMessage {
    pub fn error(request_id: Option<u64>, error: MutationError) -> Self {
        let message = error.to_string();
        ServerMessage::Error { request_id, error, message }
    }
}

/// Client transport errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events from the WebSocket client
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
    Error { message: String },
}

#[cfg(not(target_arch = "wasm32"))]
mod native_client {
    use super::*;
    use crate::hub::DeltaSource;
    use crate::persist::BoxFuture;
    use crate::service::{Actor, MutationResult, Remote};
    use std::collections::VecDeque;
    use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError, channel};
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};
    use tungstenite::{Message, connect};
    use url::Url;

    /// Commands sent to the WebSocket thread.
    enum WsCommand {
        Send(String),
        Close,
    }

    /// WebSocket client for native platforms.
    ///
    /// A background thread owns the socket; the caller exchanges messages
    /// with it over channels.
    pub struct NativeChannel {
        state: ConnectionState,
        cmd_tx: Option<Sender<WsCommand>>,
        event_rx: Option<Receiver<SyncEvent>>,
        _thread: Option<JoinHandle<()>>,
    }

    impl NativeChannel {
        pub fn new() -> Self {
            Self {
                state: ConnectionState::Disconnected,
                cmd_tx: None,
                event_rx: None,
                _thread: None,
            }
        }

        pub fn connect(&mut self, url: &str) -> Result<(), ChannelError> {
            if self.cmd_tx.is_some() {
                return Err(ChannelError::AlreadyConnected);
            }

            let parsed = Url::parse(url).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
            if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                return Err(ChannelError::InvalidUrl(format!("unsupported scheme {}", parsed.scheme())));
            }

            self.state = ConnectionState::Connecting;
            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<SyncEvent>();
            let url = url.to_string();

            let handle = thread::spawn(move || {
                log::info!("channel thread: connecting to {}", url);
                let (mut socket, response) = match connect(&url) {
                    Ok(connected) => connected,
                    Err(e) => {
                        log::error!("channel connection failed: {}", e);
                        let _ = event_tx.send(SyncEvent::Error {
                            message: format!("connection failed: {}", e),
                        });
                        return;
                    }
                };
                log::info!("channel connected, status: {}", response.status());
                let _ = event_tx.send(SyncEvent::Connected);

                if let tungstenite::stream::MaybeTlsStream::Plain(tcp) = socket.get_mut() {
                    let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
                    let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
                }

                loop {
                    match cmd_rx.try_recv() {
                        Ok(WsCommand::Send(msg)) => {
                            if let Err(e) = socket.send(Message::Text(msg)) {
                                log::error!("channel send error: {}", e);
                                break;
                            }
                        }
                        Ok(WsCommand::Close) => {
                            let _ = socket.close(None);
                            break;
                        }
                        Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }

                    match socket.read() {
                        Ok(Message::Text(txt)) => match serde_json::from_str::<ServerMessage>(&txt) {
                            Ok(msg) => {
                                let _ = event_tx.send(SyncEvent::Message(msg));
                            }
                            Err(e) => log::warn!("unparseable server message ({}): {}", e, txt),
                        },
                        Ok(Message::Ping(data)) => {
                            let _ = socket.send(Message::Pong(data));
                        }
                        Ok(Message::Close(_)) => {
                            log::info!("channel received close frame");
                            break;
                        }
                        Ok(_) => {}
                        Err(tungstenite::Error::Io(ref e))
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            log::error!("channel read error: {}", e);
                            break;
                        }
                    }
                }

                log::info!("channel thread exiting");
                let _ = event_tx.send(SyncEvent::Disconnected);
            });

            self.cmd_tx = Some(cmd_tx);
            self.event_rx = Some(event_rx);
            self._thread = Some(handle);
            Ok(())
        }

        pub fn disconnect(&mut self) {
            if let Some(tx) = self.cmd_tx.take() {
                let _ = tx.send(WsCommand::Close);
            }
            self.event_rx = None;
            self._thread = None;
            self.state = ConnectionState::Disconnected;
        }

        pub fn send(&self, msg: &ClientMessage) -> Result<(), ChannelError> {
            let tx = self.cmd_tx.as_ref().ok_or(ChannelError::NotConnected)?;
            let text = serde_json::to_string(msg)?;
            tx.send(WsCommand::Send(text))
                .map_err(|e| ChannelError::Send(e.to_string()))
        }

        /// Pending events, without blocking.
        pub fn poll_events(&mut self) -> Vec<SyncEvent> {
            let mut events = Vec::new();
            if let Some(rx) = &self.event_rx {
                while let Ok(event) = rx.try_recv() {
                    events.push(event);
                }
            }
            for event in &events {
                self.track(event);
            }
            events
        }

        /// Wait up to `timeout` for the next event.
        pub fn next_event(&mut self, timeout: Duration) -> Option<SyncEvent> {
            let event = match self.event_rx.as_ref()?.recv_timeout(timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => SyncEvent::Disconnected,
            };
            self.track(&event);
            Some(event)
        }

        fn track(&mut self, event: &SyncEvent) {
            match event {
                SyncEvent::Connected => self.state = ConnectionState::Connected,
                SyncEvent::Disconnected => self.state = ConnectionState::Disconnected,
                SyncEvent::Error { .. } => self.state = ConnectionState::Error,
                SyncEvent::Message(_) => {}
            }
        }

        pub fn state(&self) -> ConnectionState {
            self.state
        }

        pub fn is_connected(&self) -> bool {
            self.state == ConnectionState::Connected
        }
    }

    impl Default for NativeChannel {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for NativeChannel {
        fn drop(&mut self) {
            self.disconnect();
        }
    }

    struct Link {
        channel: NativeChannel,
        next_request: u64,
    }

    /// [`Remote`] over a [`NativeChannel`].
    ///
    /// Requests are issued one at a time and block the calling thread until
    /// the matching reply arrives. Deltas received meanwhile are queued for
    /// the [`ChannelDeltas`] handle.
    pub struct ChannelRemote {
        link: Mutex<Link>,
        deltas: Arc<Mutex<VecDeque<Delta>>>,
        timeout: Duration,
    }

    /// Delta side of a [`ChannelRemote`].
    pub struct ChannelDeltas {
        link: Arc<ChannelRemote>,
    }

    impl ChannelRemote {
        /// Connect, wait for the socket, and join `space`.
        pub fn connect(url: &str, actor: Actor, space: SpaceId, timeout: Duration) -> Result<Arc<Self>, ChannelError> {
            let mut channel = NativeChannel::new();
            channel.connect(url)?;
            let deadline = Instant::now() + timeout;
            while !channel.is_connected() {
                let left = deadline.saturating_duration_since(Instant::now());
                match channel.next_event(left) {
                    Some(SyncEvent::Connected) => {}
                    Some(SyncEvent::Error { message }) => return Err(ChannelError::Connect(message)),
                    Some(_) => {}
                    None => return Err(ChannelError::Connect("timed out".to_string())),
                }
            }
            channel.send(&ClientMessage::Join { space, user: actor.user, session: actor.session })?;
            Ok(Arc::new(Self {
                link: Mutex::new(Link { channel, next_request: 1 }),
                deltas: Arc::new(Mutex::new(VecDeque::new())),
                timeout,
            }))
        }

        pub fn deltas(self: &Arc<Self>) -> ChannelDeltas {
            ChannelDeltas { link: Arc::clone(self) }
        }

        fn queue(&self, delta: Delta) {
            match self.deltas.lock() {
                Ok(mut q) => q.push_back(delta),
                Err(poisoned) => poisoned.into_inner().push_back(delta),
            }
        }

        /// Move every delta that already arrived into the queue.
        fn pull(&self) {
            let mut link = match self.link.lock() {
                Ok(l) => l,
                Err(poisoned) => poisoned.into_inner(),
            };
            for event in link.channel.poll_events() {
                if let SyncEvent::Message(ServerMessage::Delta { delta, .. }) = event {
                    self.queue(delta);
                }
            }
        }

        fn round_trip(&self, build: impl FnOnce(u64) -> ClientMessage) -> MutationResult<ServerMessage> {
            let mut link = match self.link.lock() {
                Ok(l) => l,
                Err(poisoned) => poisoned.into_inner(),
            };
            let request_id = link.next_request;
            link.next_request += 1;
            link.channel
                .send(&build(request_id))
                .map_err(|e| MutationError::Network(e.to_string()))?;

            let deadline = Instant::now() + self.timeout;
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                let Some(event) = link.channel.next_event(left) else {
                    return Err(MutationError::Network(format!("request {} timed out", request_id)));
                };
                match event {
                    SyncEvent::Message(ServerMessage::Delta { delta, .. }) => self.queue(delta),
                    SyncEvent::Message(ServerMessage::Error { request_id: Some(id), error, .. })
                        if id == request_id =>
                    {
                        return Err(error);
                    }
                    SyncEvent::Message(
                        reply @ (ServerMessage::Ack { .. } | ServerMessage::Contents { .. }),
                    ) => {
                        if reply_id(&reply) == Some(request_id) {
                            return Ok(reply);
                        }
                        log::debug!("discarding stale reply {:?}", reply_id(&reply));
                    }
                    SyncEvent::Disconnected => {
                        return Err(MutationError::Network("connection closed".to_string()));
                    }
                    SyncEvent::Error { message } => return Err(MutationError::Network(message)),
                    SyncEvent::Message(other) => log::debug!("ignoring {:?}", other),
                    SyncEvent::Connected => {}
                }
            }
        }
    }

    fn reply_id(msg: &ServerMessage) -> Option<u64> {
        match msg {
            ServerMessage::Ack { request_id, .. } | ServerMessage::Contents { request_id, .. } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    impl Remote for ChannelRemote {
        fn submit(&self, _actor: Actor, mutation: Mutation) -> BoxFuture<'_, MutationResult<Ack>> {
            Box::pin(async move {
                match self.round_trip(|request_id| ClientMessage::Request { request_id, mutation })? {
                    ServerMessage::Ack { ack, .. } => Ok(ack),
                    other => Err(MutationError::Other(format!("unexpected reply {:?}", other))),
                }
            })
        }

        fn fetch_space(&self, _space: SpaceId) -> BoxFuture<'_, MutationResult<SpaceContents>> {
            Box::pin(async move {
                match self.round_trip(|request_id| ClientMessage::Fetch { request_id })? {
                    ServerMessage::Contents { contents, .. } => Ok(contents),
                    other => Err(MutationError::Other(format!("unexpected reply {:?}", other))),
                }
            })
        }
    }

    impl DeltaSource for ChannelDeltas {
        fn drain(&mut self) -> Vec<Delta> {
            self.link.pull();
            match self.link.deltas.lock() {
                Ok(mut q) => q.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            }
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native_client::{ChannelDeltas, ChannelRemote, NativeChannel};
