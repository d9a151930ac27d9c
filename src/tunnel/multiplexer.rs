//! Channel multiplexer for the tunnel
//!
//! Owns the read loop of one tunnel connection. A dedicated reader task
//! decodes frames and hands them to the dispatch loop, which never blocks
//! on a single channel: anything that can wait (closing a channel, dialing
//! an upstream) runs in its own task. All writes go through one
//! [`FrameWriter`].

use super::{
    Activity, Channel, ChannelEvent, ChannelState, ChannelTable, ClientChannel, ConnectOutcome,
    ConnectRequest, FrameCodec, FrameSender, FrameWriter, MessageType, ServerChannel, TunnelError,
    TunnelMessage, FRAME_QUEUE_DEPTH,
};
use crate::crypto::PayloadCipher;
use crate::obfuscation::{unpad, PaddingConfig, ShapingConfig, TrafficShaper};
use crate::protocol::{
    CHANNEL_CONNECT_TIMEOUT, CHANNEL_READ_CHUNK, CONTROL_CHANNEL, IDLE_TIMEOUT, KEEPALIVE_TIMEOUT,
};
use crate::transport::UpstreamConnector;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Longest wait for channels still closing when a connection ends
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(6);

/// What to do when the tunnel has been silent for the idle timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdlePolicy {
    /// Send one KEEPALIVE and require an answer
    Ping,
    /// Close the connection gracefully
    Close,
}

/// Multiplexer settings
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub idle_timeout: Duration,
    pub idle_policy: IdlePolicy,
    pub keepalive_timeout: Duration,
    /// Client only: wait for CONNECT_OK/CONNECT_FAIL
    pub connect_timeout: Duration,
    pub max_channels: u16,
    pub codec: FrameCodec,
    pub shaping: Option<ShapingConfig>,
    /// Both ends must agree on this
    pub padding: Option<PaddingConfig>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            idle_policy: IdlePolicy::Ping,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            connect_timeout: CHANNEL_CONNECT_TIMEOUT,
            max_channels: 1000,
            codec: FrameCodec::default(),
            shaping: None,
            padding: None,
        }
    }
}

/// Message from the reader task
enum ReaderMessage {
    Frame(TunnelMessage),
    Error(TunnelError),
    Closed,
}

/// State shared by the dispatch loop and the tasks it spawns
struct MuxCore<C> {
    table: ChannelTable<C>,
    frames: FrameSender,
    events: mpsc::UnboundedSender<ChannelEvent>,
    activity: Arc<Activity>,
    /// Signalled whenever an id goes back to the pool
    freed: Notify,
}

/// Close a channel, optionally telling the peer, then free its id
///
/// `farewell` is queued after the channel's socket is released and before
/// the id is reusable.
async fn close_channel<C: Channel>(core: &MuxCore<C>, id: u16, farewell: Option<TunnelMessage>) {
    let Some(channel) = core.table.begin_close(id) else {
        return;
    };

    channel.close().await;
    if let Some(msg) = farewell {
        let _ = core.frames.send(msg).await;
    }
    core.table.finish_close(id);
    core.freed.notify_waiters();
    trace!(channel = id, "Channel id released");
}

fn spawn_close<C: Channel>(core: &Arc<MuxCore<C>>, id: u16, notify_peer: bool) {
    let core = Arc::clone(core);
    tokio::spawn(async move {
        let farewell = notify_peer.then(|| TunnelMessage::close(id));
        close_channel(&core, id, farewell).await;
    });
}

/// Role-specific handling of the CONNECT family
trait Role: Send + Sync + 'static {
    type Chan: Channel;

    fn on_connect_frame(&self, core: &Arc<MuxCore<Self::Chan>>, msg: TunnelMessage);
}

/// Tasks and receivers of one running connection
struct Plumbing<C> {
    core: Arc<MuxCore<C>>,
    reader_rx: mpsc::Receiver<ReaderMessage>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    writer: JoinHandle<Result<(), TunnelError>>,
    reader: JoinHandle<()>,
}

fn start_io<S, C>(
    stream: S,
    leftover: BytesMut,
    config: &MuxConfig,
    ciphers: Option<(PayloadCipher, PayloadCipher)>,
) -> Plumbing<C>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    C: Channel,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (frames, frames_rx) = FrameSender::channel(FRAME_QUEUE_DEPTH);
    let (events, events_rx) = mpsc::unbounded_channel();
    let activity = Arc::new(Activity::new());

    let (send_cipher, recv_cipher) = match ciphers {
        Some((send, recv)) => (Some(send), Some(recv)),
        None => (None, None),
    };

    let writer = tokio::spawn(
        FrameWriter::new(write_half, frames_rx, Arc::clone(&activity))
            .with_cipher(send_cipher)
            .with_shaper(config.shaping.map(TrafficShaper::new))
            .with_padding(config.padding.clone())
            .run(),
    );

    // Dedicated reader task so a slow dispatch never cancels a partial read
    let (reader_tx, reader_rx) = mpsc::channel(256);
    let reader = tokio::spawn(read_frames(
        read_half,
        leftover,
        config.codec,
        recv_cipher,
        config.padding.is_some(),
        Arc::clone(&activity),
        reader_tx,
    ));

    Plumbing {
        core: Arc::new(MuxCore {
            table: ChannelTable::new(config.max_channels),
            frames,
            events,
            activity,
            freed: Notify::new(),
        }),
        reader_rx,
        events_rx,
        writer,
        reader,
    }
}

async fn read_frames<R>(
    mut reader: R,
    mut buf: BytesMut,
    codec: FrameCodec,
    mut cipher: Option<PayloadCipher>,
    padded: bool,
    activity: Arc<Activity>,
    tx: mpsc::Sender<ReaderMessage>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        loop {
            match codec.decode_from(&mut buf) {
                Ok(Some(mut msg)) => {
                    if msg.msg_type == MessageType::Data {
                        if let Some(cipher) = cipher.as_mut() {
                            match cipher.open(&msg.payload) {
                                Ok(plain) => msg.payload = Bytes::from(plain),
                                Err(e) => {
                                    let _ = tx.send(ReaderMessage::Error(e.into())).await;
                                    return;
                                }
                            }
                        }
                        if padded {
                            match unpad(&msg.payload) {
                                Ok(data) => msg.payload = data,
                                Err(e) => {
                                    let _ = tx.send(ReaderMessage::Error(e.into())).await;
                                    return;
                                }
                            }
                        }
                    }
                    if tx.send(ReaderMessage::Frame(msg)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(ReaderMessage::Error(e.into())).await;
                    return;
                }
            }
        }

        buf.reserve(CHANNEL_READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(ReaderMessage::Closed).await;
                return;
            }
            Ok(n) => {
                trace!(bytes = n, "Tunnel read");
                activity.touch();
            }
            Err(e) => {
                let _ = tx.send(ReaderMessage::Error(e.into())).await;
                return;
            }
        }
    }
}

/// Dispatch frames until the connection ends
async fn drive<R: Role>(
    role: &R,
    plumbing: &mut Plumbing<R::Chan>,
    config: &MuxConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    let core = Arc::clone(&plumbing.core);
    let mut ping_deadline: Option<Instant> = None;

    loop {
        let wake_at = ping_deadline.unwrap_or_else(|| core.activity.last() + config.idle_timeout);

        tokio::select! {
            msg = plumbing.reader_rx.recv() => match msg {
                Some(ReaderMessage::Frame(msg)) => {
                    ping_deadline = None;
                    dispatch(role, &core, msg);
                }
                Some(ReaderMessage::Error(e)) => return Err(e),
                Some(ReaderMessage::Closed) | None => {
                    debug!("Tunnel connection closed by peer");
                    return Ok(());
                }
            },

            Some(event) = plumbing.events_rx.recv() => {
                match &event {
                    ChannelEvent::LocalEof(id) => debug!(channel = id, "Local socket closed"),
                    ChannelEvent::LocalError(id, e) => debug!(channel = id, "Local read failed: {}", e),
                    ChannelEvent::WriteFailed(id, e) => debug!(channel = id, "Local write failed: {}", e),
                }
                spawn_close(&core, event.channel_id(), true);
            }

            result = &mut plumbing.writer => {
                return match result {
                    Ok(Ok(())) => Err(TunnelError::ConnectionClosed),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(TunnelError::ConnectionClosed),
                };
            }

            _ = tokio::time::sleep_until(wake_at) => {
                if let Some(deadline) = ping_deadline {
                    if Instant::now() >= deadline {
                        warn!("Keepalive not answered within {:?}", config.keepalive_timeout);
                        return Err(TunnelError::KeepaliveTimeout);
                    }
                } else if core.activity.idle_for() >= config.idle_timeout {
                    match config.idle_policy {
                        IdlePolicy::Close => {
                            info!("Tunnel idle for {:?}, closing", config.idle_timeout);
                            return Ok(());
                        }
                        IdlePolicy::Ping => {
                            debug!("Tunnel idle, sending keepalive");
                            core.frames.send_detached(TunnelMessage::keepalive());
                            ping_deadline = Some(Instant::now() + config.keepalive_timeout);
                        }
                    }
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Multiplexer shutdown requested");
                    return Ok(());
                }
            }
        }
    }
}

fn dispatch<R: Role>(role: &R, core: &Arc<MuxCore<R::Chan>>, msg: TunnelMessage) {
    let id = msg.channel_id;

    match msg.msg_type {
        MessageType::Data => match core.table.get(id) {
            Some(channel) => {
                if let Err(e) = channel.deliver(msg.payload) {
                    match e {
                        TunnelError::ChannelStalled(_) => warn!(channel = id, "Local socket stalled, closing channel"),
                        _ => debug!(channel = id, "Cannot deliver DATA: {}", e),
                    }
                    spawn_close(core, id, true);
                }
            }
            None => trace!(channel = id, bytes = msg.payload.len(), "DATA for unknown channel dropped"),
        },
        MessageType::Close => {
            trace!(channel = id, "Peer closed channel");
            spawn_close(core, id, false);
        }
        MessageType::Keepalive => core.frames.send_detached(TunnelMessage::keepalive_ack()),
        MessageType::KeepaliveAck => trace!("Keepalive answered"),
        MessageType::Connect | MessageType::ConnectOk | MessageType::ConnectFail => {
            role.on_connect_frame(core, msg)
        }
    }
}

/// Close every channel and wait until all ids are back in the pool
///
/// Channels close concurrently; the whole teardown shares one deadline.
async fn teardown<C: Channel>(plumbing: Plumbing<C>) {
    let core = plumbing.core;
    plumbing.reader.abort();

    let deadline = Instant::now() + TEARDOWN_TIMEOUT;
    let mut closing = JoinSet::new();
    for channel in core.table.drain() {
        let core = Arc::clone(&core);
        closing.spawn(async move {
            let id = channel.id();
            channel.close().await;
            core.table.finish_close(id);
            core.freed.notify_waiters();
        });
    }

    loop {
        let freed = core.freed.notified();
        tokio::pin!(freed);
        freed.as_mut().enable();

        if core.table.is_empty() {
            break;
        }
        if tokio::time::timeout_at(deadline, freed).await.is_err() {
            warn!("{} channel(s) still closing at teardown", core.table.len());
            break;
        }
    }

    closing.abort_all();
    plumbing.writer.abort();
}

struct ClientRole;

impl Role for ClientRole {
    type Chan = ClientChannel;

    fn on_connect_frame(&self, core: &Arc<MuxCore<ClientChannel>>, msg: TunnelMessage) {
        let id = msg.channel_id;

        match msg.msg_type {
            MessageType::ConnectOk => match core.table.get(id) {
                Some(channel) if channel.state() == ChannelState::Pending => {
                    if !channel.resolve(ConnectOutcome::Established) {
                        debug!(channel = id, "CONNECT_OK after opener gave up");
                        spawn_close(core, id, true);
                    }
                }
                Some(_) => debug!(channel = id, "Duplicate CONNECT_OK ignored"),
                None => {
                    debug!(channel = id, "CONNECT_OK for unknown channel");
                    core.frames.send_detached(TunnelMessage::close(id));
                }
            },
            MessageType::ConnectFail => {
                let reason = msg.reason();
                match core.table.get(id) {
                    Some(channel) => {
                        if !channel.resolve(ConnectOutcome::Refused(reason)) {
                            spawn_close(core, id, false);
                        }
                    }
                    None => trace!(channel = id, "CONNECT_FAIL for unknown channel"),
                }
            }
            _ => warn!(channel = id, "Ignoring {:?} from server", msg.msg_type),
        }
    }
}

struct ClientInner {
    core: Arc<MuxCore<ClientChannel>>,
    config: MuxConfig,
    shutdown: watch::Sender<bool>,
    done: watch::Receiver<bool>,
    reason: Arc<Mutex<Option<String>>>,
}

/// Client side of a tunnel connection
///
/// Cheap to clone. Dropping the last clone shuts the connection down.
#[derive(Clone)]
pub struct ClientMultiplexer {
    inner: Arc<ClientInner>,
}

impl ClientMultiplexer {
    /// Start multiplexing over an established tunnel stream
    ///
    /// `leftover` holds bytes read past the handshake.
    pub fn start<S>(
        stream: S,
        leftover: BytesMut,
        config: MuxConfig,
        ciphers: Option<(PayloadCipher, PayloadCipher)>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut plumbing = start_io::<_, ClientChannel>(stream, leftover, &config, ciphers);
        let core = Arc::clone(&plumbing.core);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let reason = Arc::new(Mutex::new(None));

        let task_config = config.clone();
        let task_reason = Arc::clone(&reason);
        tokio::spawn(async move {
            let result = drive(&ClientRole, &mut plumbing, &task_config, &mut shutdown_rx).await;
            if let Err(e) = &result {
                debug!("Tunnel connection ended: {}", e);
                *task_reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
            }
            teardown(plumbing).await;
            let _ = done_tx.send(true);
        });

        Self {
            inner: Arc::new(ClientInner {
                core,
                config,
                shutdown: shutdown_tx,
                done: done_rx,
                reason,
            }),
        }
    }

    /// Open a channel to `host:port` and wait for the server's answer
    pub async fn open_channel(&self, host: &str, port: u16) -> Result<Arc<ClientChannel>, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ConnectionClosed);
        }

        let core = &self.inner.core;
        let request = ConnectRequest::new(host, port);
        request.encode()?;

        let mut outcome_rx = None;
        let channel = core.table.allocate(|id| {
            let (channel, rx) = ClientChannel::new(id, request.clone(), core.frames.clone(), core.events.clone());
            outcome_rx = Some(rx);
            Arc::new(channel)
        })?;
        let id = channel.id();
        let outcome_rx = outcome_rx.ok_or(TunnelError::ConnectionClosed)?;

        debug!(channel = id, "Opening channel to {}", request);
        let sent = match TunnelMessage::connect(id, &request) {
            Ok(msg) => core.frames.send(msg).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            close_channel(core, id, None).await;
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.connect_timeout, outcome_rx).await {
            Ok(Ok(ConnectOutcome::Established)) => {
                debug!(channel = id, "Channel to {} open", request);
                Ok(channel)
            }
            Ok(Ok(ConnectOutcome::Refused(reason))) => {
                debug!(channel = id, "Server refused {}: {}", request, reason);
                close_channel(core, id, None).await;
                Err(TunnelError::ConnectFailed(reason))
            }
            Ok(Err(_)) => {
                close_channel(core, id, None).await;
                Err(TunnelError::ConnectionClosed)
            }
            Err(_) => {
                debug!(channel = id, "No answer for {} within {:?}", request, self.inner.config.connect_timeout);
                close_channel(core, id, Some(TunnelMessage::close(id))).await;
                Err(TunnelError::ConnectTimeout)
            }
        }
    }

    /// Close a channel and tell the server
    pub async fn close_channel(&self, id: u16) {
        close_channel(&self.inner.core, id, Some(TunnelMessage::close(id))).await;
    }

    /// Wait until the connection has ended and every channel is released
    ///
    /// Returns the error that ended it, if any.
    pub async fn closed(&self) -> Option<String> {
        let mut done = self.inner.done.clone();
        let _ = done.wait_for(|done| *done).await;
        self.close_reason()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tear the connection down and wait for all channels to close
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        self.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.done.borrow() || *self.inner.shutdown.borrow()
    }

    /// Ids currently taken, including channels still closing
    pub fn channel_count(&self) -> usize {
        self.inner.core.table.len()
    }

    pub fn open_channels(&self) -> Vec<u16> {
        self.inner.core.table.open_ids()
    }
}

struct ServerRole {
    connector: Arc<UpstreamConnector>,
    user: String,
    log_channels: bool,
}

impl Role for ServerRole {
    type Chan = ServerChannel;

    fn on_connect_frame(&self, core: &Arc<MuxCore<ServerChannel>>, msg: TunnelMessage) {
        let id = msg.channel_id;

        if msg.msg_type != MessageType::Connect {
            warn!(channel = id, "Ignoring {:?} from client", msg.msg_type);
            return;
        }

        let request = match ConnectRequest::parse(&msg.payload) {
            Ok(request) if id != CONTROL_CHANNEL => request,
            Ok(_) => {
                core.frames.send_detached(TunnelMessage::connect_fail(id, "invalid channel"));
                return;
            }
            Err(e) => {
                debug!(channel = id, "Bad CONNECT payload: {}", e);
                core.frames.send_detached(TunnelMessage::connect_fail(id, "invalid request"));
                return;
            }
        };

        let channel = Arc::new(ServerChannel::new(id, request, core.frames.clone(), core.events.clone()));

        // Registered before the next frame is dispatched, so DATA pipelined
        // behind the CONNECT is queued on the pending channel
        let registered = match core.table.insert(Arc::clone(&channel)) {
            Ok(()) => true,
            Err(TunnelError::ChannelInUse(_)) => false,
            Err(e) => {
                debug!(channel = id, "Cannot register channel: {}", e);
                core.frames.send_detached(TunnelMessage::connect_fail(id, "channel unavailable"));
                return;
            }
        };

        tokio::spawn(serve_connect(
            Arc::clone(core),
            Arc::clone(&self.connector),
            channel,
            registered,
            self.user.clone(),
            self.log_channels,
        ));
    }
}

/// Put a server channel in the table, evicting a stale one with the same id
async fn register(core: &MuxCore<ServerChannel>, channel: &Arc<ServerChannel>) -> Result<(), TunnelError> {
    let id = channel.id();
    let deadline = Instant::now() + TEARDOWN_TIMEOUT;

    loop {
        let freed = core.freed.notified();
        tokio::pin!(freed);
        freed.as_mut().enable();

        match core.table.insert(Arc::clone(channel)) {
            Err(TunnelError::ChannelInUse(_)) => {
                if core.table.get(id).is_some() {
                    debug!(channel = id, "CONNECT reuses a live channel id, closing the old channel");
                    close_channel(core, id, None).await;
                    continue;
                }
                if tokio::time::timeout_at(deadline, freed).await.is_err() {
                    return Err(TunnelError::ChannelInUse(id));
                }
            }
            other => return other,
        }
    }
}

/// Connect upstream for a CONNECT and hand the socket to the channel
///
/// `registered` is false when the id was still taken at dispatch time.
async fn serve_connect(
    core: Arc<MuxCore<ServerChannel>>,
    connector: Arc<UpstreamConnector>,
    channel: Arc<ServerChannel>,
    registered: bool,
    user: String,
    log_channels: bool,
) {
    let id = channel.id();
    let request = channel.target().clone();

    if !registered {
        if let Err(e) = register(&core, &channel).await {
            debug!(channel = id, "Cannot register channel: {}", e);
            let _ = core.frames.send(TunnelMessage::connect_fail(id, "channel unavailable")).await;
            return;
        }
    }

    match connector.connect(&request.host, request.port).await {
        Ok((upstream, strategy)) => {
            if log_channels {
                info!(user = %user, channel = id, "Connected to {} via {}", request, strategy);
            } else {
                debug!(user = %user, channel = id, "Connected to {} via {}", request, strategy);
            }

            match channel.establish(upstream, strategy).await {
                Ok(()) => {}
                Err(TunnelError::ChannelClosed(_)) => {
                    debug!(channel = id, "Channel closed while connecting");
                }
                Err(e) => {
                    debug!(channel = id, "Cannot start channel: {}", e);
                    close_channel(&core, id, Some(TunnelMessage::connect_fail(id, "tunnel error"))).await;
                }
            }
        }
        Err(e) => {
            if log_channels {
                info!(user = %user, channel = id, "{}", e);
            } else {
                debug!(user = %user, channel = id, "{}", e);
            }
            close_channel(&core, id, Some(TunnelMessage::connect_fail(id, &e.reason()))).await;
        }
    }
}

/// Server side of a tunnel connection
pub struct ServerMultiplexer {
    connector: Arc<UpstreamConnector>,
    config: MuxConfig,
    user: String,
    log_channels: bool,
    ciphers: Option<(PayloadCipher, PayloadCipher)>,
}

impl ServerMultiplexer {
    pub fn new(connector: Arc<UpstreamConnector>, config: MuxConfig) -> Self {
        Self {
            connector,
            config,
            user: String::new(),
            log_channels: true,
            ciphers: None,
        }
    }

    /// Authenticated user, and whether its channels are logged at info level
    pub fn with_user(mut self, user: impl Into<String>, log_channels: bool) -> Self {
        self.user = user.into();
        self.log_channels = log_channels;
        self
    }

    pub fn with_ciphers(mut self, ciphers: Option<(PayloadCipher, PayloadCipher)>) -> Self {
        self.ciphers = ciphers;
        self
    }

    /// Serve the connection until the client goes away
    pub async fn run<S>(self, stream: S, leftover: BytesMut) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut plumbing = start_io::<_, ServerChannel>(stream, leftover, &self.config, self.ciphers);
        let role = ServerRole {
            connector: self.connector,
            user: self.user,
            log_channels: self.log_channels,
        };

        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let result = drive(&role, &mut plumbing, &self.config, &mut shutdown_rx).await;
        teardown(plumbing).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UpstreamConfig;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    /// Far end of the tunnel, speaking raw frames
    struct Peer {
        stream: DuplexStream,
        buf: BytesMut,
    }

    impl Peer {
        async fn send(&mut self, msg: TunnelMessage) {
            self.stream.write_all(&msg.encode().unwrap()).await.unwrap();
        }

        async fn recv(&mut self) -> Option<TunnelMessage> {
            let codec = FrameCodec::default();
            loop {
                if let Some(msg) = codec.decode_from(&mut self.buf).unwrap() {
                    return Some(msg);
                }
                if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                    return None;
                }
            }
        }
    }

    fn pair() -> (DuplexStream, Peer) {
        let (local, remote) = tokio::io::duplex(1 << 20);
        (
            local,
            Peer {
                stream: remote,
                buf: BytesMut::new(),
            },
        )
    }

    fn connector() -> Arc<UpstreamConnector> {
        Arc::new(UpstreamConnector::new(UpstreamConfig {
            attempt_timeout: Duration::from_secs(2),
            ipv6_supported: Some(false),
            ipv4_fallback: BTreeMap::new(),
            alternate_resolver: None,
        }))
    }

    #[tokio::test]
    async fn test_client_open_and_relay() {
        let (local, mut peer) = pair();
        let mux = ClientMultiplexer::start(local, BytesMut::new(), MuxConfig::default(), None);

        let opener = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.open_channel("example.com", 80).await })
        };

        let connect = peer.recv().await.unwrap();
        assert_eq!(connect.msg_type, MessageType::Connect);
        let request = ConnectRequest::parse(&connect.payload).unwrap();
        assert_eq!(request, ConnectRequest::new("example.com", 80));
        peer.send(TunnelMessage::connect_ok(connect.channel_id)).await;

        let channel = opener.await.unwrap().unwrap();
        assert_eq!(channel.id(), connect.channel_id);
        assert_eq!(mux.open_channels(), vec![channel.id()]);

        let (app, mut socks_side) = tokio::io::duplex(4096);
        channel.attach(app).await.unwrap();

        socks_side.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let data = peer.recv().await.unwrap();
        assert_eq!(data.msg_type, MessageType::Data);
        assert_eq!(&data.payload[..], b"GET / HTTP/1.0\r\n\r\n");

        peer.send(TunnelMessage::data(channel.id(), Bytes::from_static(b"HTTP/1.0 200 OK\r\n"))).await;
        let mut reply = vec![0u8; 17];
        socks_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.0 200 OK\r\n");

        // Local EOF closes the channel and tells the peer
        drop(socks_side);
        let close = peer.recv().await.unwrap();
        assert_eq!(close.msg_type, MessageType::Close);
        assert_eq!(close.channel_id, channel.id());

        mux.shutdown().await;
        assert!(mux.is_closed());
        assert_eq!(mux.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_client_refused() {
        let (local, mut peer) = pair();
        let mux = ClientMultiplexer::start(local, BytesMut::new(), MuxConfig::default(), None);

        let opener = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.open_channel("nosuchhost.invalid", 80).await })
        };

        let connect = peer.recv().await.unwrap();
        peer.send(TunnelMessage::connect_fail(connect.channel_id, "no route")).await;

        match opener.await.unwrap() {
            Err(TunnelError::ConnectFailed(reason)) => assert_eq!(reason, "no route"),
            other => panic!("unexpected result: {:?}", other.map(|c| c.id())),
        }
        assert_eq!(mux.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_connect_timeout_sends_close() {
        let (local, mut peer) = pair();
        let config = MuxConfig {
            connect_timeout: Duration::from_secs(30),
            ..MuxConfig::default()
        };
        let mux = ClientMultiplexer::start(local, BytesMut::new(), config, None);

        let result = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.open_channel("slow.example", 443).await })
        };

        let connect = peer.recv().await.unwrap();
        assert!(matches!(result.await.unwrap(), Err(TunnelError::ConnectTimeout)));

        let close = peer.recv().await.unwrap();
        assert_eq!(close.msg_type, MessageType::Close);
        assert_eq!(close.channel_id, connect.channel_id);

        // A late answer is turned away
        peer.send(TunnelMessage::connect_ok(connect.channel_id)).await;
        let close = peer.recv().await.unwrap();
        assert_eq!(close.msg_type, MessageType::Close);
    }

    #[tokio::test]
    async fn test_client_answers_keepalive_and_ignores_strays() {
        let (local, mut peer) = pair();
        let _mux = ClientMultiplexer::start(local, BytesMut::new(), MuxConfig::default(), None);

        peer.send(TunnelMessage::data(42, Bytes::from_static(b"late"))).await;
        peer.send(TunnelMessage::close(42)).await;
        peer.send(TunnelMessage::keepalive()).await;

        let ack = peer.recv().await.unwrap();
        assert_eq!(ack.msg_type, MessageType::KeepaliveAck);
        assert_eq!(ack.channel_id, CONTROL_CHANNEL);
    }

    #[tokio::test]
    async fn test_client_fails_pending_on_disconnect() {
        let (local, mut peer) = pair();
        let mux = ClientMultiplexer::start(local, BytesMut::new(), MuxConfig::default(), None);

        let opener = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.open_channel("example.com", 80).await })
        };
        peer.recv().await.unwrap();
        drop(peer);

        assert!(matches!(opener.await.unwrap(), Err(TunnelError::ConnectionClosed)));
        assert!(mux.closed().await.is_none());
        assert!(matches!(
            mux.open_channel("example.com", 80).await,
            Err(TunnelError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal() {
        let (local, mut peer) = pair();
        let mux = ClientMultiplexer::start(local, BytesMut::new(), MuxConfig::default(), None);

        peer.stream.write_all(&[9, 6, 0, 0, 0, 0]).await.unwrap();
        let reason = mux.closed().await.unwrap();
        assert!(reason.contains("Version mismatch"));
    }

    #[tokio::test]
    async fn test_leftover_bytes_are_decoded_first() {
        let (local, mut peer) = pair();
        let leftover = TunnelMessage::keepalive().encode().unwrap();
        let _mux = ClientMultiplexer::start(local, leftover, MuxConfig::default(), None);

        let ack = peer.recv().await.unwrap();
        assert_eq!(ack.msg_type, MessageType::KeepaliveAck);
    }

    #[tokio::test]
    async fn test_server_connects_and_relays() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (local, mut peer) = pair();
        let server = ServerMultiplexer::new(connector(), MuxConfig::default()).with_user("alice", false);
        let task = tokio::spawn(server.run(local, BytesMut::new()));

        let request = ConnectRequest::new("127.0.0.1", port);
        peer.send(TunnelMessage::connect(7, &request).unwrap()).await;

        let (mut upstream, _) = listener.accept().await.unwrap();
        let ok = peer.recv().await.unwrap();
        assert_eq!(ok.msg_type, MessageType::ConnectOk);
        assert_eq!(ok.channel_id, 7);

        peer.send(TunnelMessage::data(7, Bytes::from_static(b"ping"))).await;
        let mut got = [0u8; 4];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        let data = peer.recv().await.unwrap();
        assert_eq!((data.msg_type, &data.payload[..]), (MessageType::Data, &b"pong"[..]));

        // Peer CLOSE releases the upstream socket
        peer.send(TunnelMessage::close(7)).await;
        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        drop(peer);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_reports_connect_failures() {
        let (local, mut peer) = pair();
        let server = ServerMultiplexer::new(connector(), MuxConfig::default());
        let _task = tokio::spawn(server.run(local, BytesMut::new()));

        peer.send(TunnelMessage::connect(3, &ConnectRequest::new("nosuchhost.invalid", 80)).unwrap()).await;
        let fail = peer.recv().await.unwrap();
        assert_eq!(fail.msg_type, MessageType::ConnectFail);
        assert_eq!(fail.channel_id, 3);
        assert!(!fail.reason().is_empty());

        // Truncated CONNECT payload
        peer.send(TunnelMessage::new(MessageType::Connect, 4, Bytes::from_static(&[5, b'a']))).await;
        let fail = peer.recv().await.unwrap();
        assert_eq!((fail.msg_type, fail.channel_id), (MessageType::ConnectFail, 4));
        assert_eq!(fail.reason(), "invalid request");
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_keepalive_ping_times_out() {
        let (local, mut peer) = pair();
        let config = MuxConfig {
            idle_timeout: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(5),
            ..MuxConfig::default()
        };
        let task = tokio::spawn(ServerMultiplexer::new(connector(), config).run(local, BytesMut::new()));

        let ping = peer.recv().await.unwrap();
        assert_eq!(ping.msg_type, MessageType::Keepalive);

        assert!(matches!(task.await.unwrap(), Err(TunnelError::KeepaliveTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_close_policy() {
        let (local, _peer) = pair();
        let config = MuxConfig {
            idle_timeout: Duration::from_secs(10),
            idle_policy: IdlePolicy::Close,
            ..MuxConfig::default()
        };
        let task = tokio::spawn(ServerMultiplexer::new(connector(), config).run(local, BytesMut::new()));

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_server_keeps_data_pipelined_behind_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (local, mut peer) = pair();
        let task = tokio::spawn(ServerMultiplexer::new(connector(), MuxConfig::default()).run(local, BytesMut::new()));

        // One write, so the DATA is decoded before the upstream dial finishes
        let mut burst = TunnelMessage::connect(9, &ConnectRequest::new("127.0.0.1", port))
            .unwrap()
            .encode()
            .unwrap();
        TunnelMessage::data(9, Bytes::from_static(b"early"))
            .encode_into(&mut burst)
            .unwrap();
        peer.stream.write_all(&burst).await.unwrap();

        let (mut upstream, _) = listener.accept().await.unwrap();
        let mut got = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), upstream.read_exact(&mut got))
            .await
            .expect("pipelined DATA must reach the upstream")
            .unwrap();
        assert_eq!(&got, b"early");

        let ok = peer.recv().await.unwrap();
        assert_eq!((ok.msg_type, ok.channel_id), (MessageType::ConnectOk, 9));

        drop(peer);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_closes_channels_concurrently() {
        let (local, mut peer) = pair();
        let mux = ClientMultiplexer::start(local, BytesMut::new(), MuxConfig::default(), None);

        // Local sockets nobody reads, so every close waits out its drain
        let mut stuck = Vec::new();
        for _ in 0..3 {
            let opener = {
                let mux = mux.clone();
                tokio::spawn(async move { mux.open_channel("example.com", 80).await })
            };
            let connect = peer.recv().await.unwrap();
            peer.send(TunnelMessage::connect_ok(connect.channel_id)).await;
            let channel = opener.await.unwrap().unwrap();

            let (app, socks_side) = tokio::io::duplex(16);
            channel.attach(app).await.unwrap();
            peer.send(TunnelMessage::data(channel.id(), Bytes::from(vec![b'x'; 1024]))).await;
            stuck.push(socks_side);
        }

        let started = Instant::now();
        drop(peer);
        mux.closed().await;

        assert!(started.elapsed() < TEARDOWN_TIMEOUT, "teardown took {:?}", started.elapsed());
        assert_eq!(mux.channel_count(), 0);
    }
}
