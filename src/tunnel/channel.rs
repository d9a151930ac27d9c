//! Tunnel channels
//!
//! A channel is one proxied TCP flow. Once a local socket is attached, two
//! pumps run for it: one reads the socket and emits DATA frames, the other
//! writes inbound DATA payloads to the socket. Closing cancels both and
//! drops the socket before the id goes back to the pool.

use super::{ChannelEvent, FrameSender, TunnelError};
use crate::protocol::CHANNEL_READ_CHUNK;
use crate::transport::Strategy;
use crate::tunnel::{ConnectRequest, TunnelMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Chunks buffered for a channel's local socket before it is judged stalled
pub const INBOUND_QUEUE_DEPTH: usize = 256;

/// How long queued inbound data may take to flush on close
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CONNECT issued or being served, no result yet
    Pending,
    /// Data flows in both directions
    Open,
    /// Pumps are being cancelled
    Closing,
    /// Socket released, id reusable
    Closed,
}

/// Result of a CONNECT as reported by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Established,
    Refused(String),
}

/// Interface shared by both roles' channels
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn id(&self) -> u16;

    fn state(&self) -> ChannelState;

    fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Queue a DATA payload for the local socket without waiting
    fn deliver(&self, data: Bytes) -> Result<(), TunnelError>;

    /// Cancel the pumps and release the socket; repeated calls are no-ops
    async fn close(&self);
}

#[derive(Default)]
struct Tasks {
    closed: bool,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Socket plumbing common to both roles
struct ChannelIo {
    id: u16,
    state: Mutex<ChannelState>,
    inbound_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    tasks: tokio::sync::Mutex<Tasks>,
    frames: FrameSender,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelIo {
    fn new(id: u16, frames: FrameSender, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        Self {
            id,
            state: Mutex::new(ChannelState::Pending),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            tasks: tokio::sync::Mutex::new(Tasks::default()),
            frames,
            events,
        }
    }

    fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ChannelState) {
        *lock(&self.state) = state;
    }

    /// Pending -> Open; false if the channel already moved on
    fn mark_open(&self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            ChannelState::Pending => {
                *state = ChannelState::Open;
                true
            }
            ChannelState::Open => true,
            ChannelState::Closing | ChannelState::Closed => false,
        }
    }

    /// Queue a payload for the local socket
    ///
    /// While Pending the queue holds data that raced ahead of the connect;
    /// the writer pump flushes it once the socket is attached.
    fn deliver(&self, data: Bytes) -> Result<(), TunnelError> {
        if !matches!(self.state(), ChannelState::Pending | ChannelState::Open) {
            return Err(TunnelError::ChannelClosed(self.id));
        }

        let guard = lock(&self.inbound_tx);
        let tx = guard.as_ref().ok_or(TunnelError::ChannelClosed(self.id))?;
        tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TunnelError::ChannelStalled(self.id),
            mpsc::error::TrySendError::Closed(_) => TunnelError::ChannelClosed(self.id),
        })
    }

    /// Hand the local socket to the channel and start both pumps
    ///
    /// `announce` is queued on the tunnel before the socket is first read,
    /// so the peer sees it ahead of any DATA for this channel.
    async fn attach<S>(&self, stream: S, announce: Option<TunnelMessage>) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if tasks.closed || !self.mark_open() {
            return Err(TunnelError::ChannelClosed(self.id));
        }

        let inbound = lock(&self.inbound_rx)
            .take()
            .ok_or(TunnelError::ChannelClosed(self.id))?;

        if let Some(msg) = announce {
            self.frames.send(msg).await?;
        }

        let (read_half, write_half) = tokio::io::split(stream);
        tasks.writer = Some(tokio::spawn(inbound_pump(
            self.id,
            write_half,
            inbound,
            self.events.clone(),
        )));
        tasks.reader = Some(tokio::spawn(outbound_pump(
            self.id,
            read_half,
            self.frames.clone(),
            self.events.clone(),
        )));

        Ok(())
    }

    async fn close(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.closed {
            return;
        }
        tasks.closed = true;
        self.set_state(ChannelState::Closing);

        // Dropping the sender lets the writer flush what is queued and stop
        lock(&self.inbound_tx).take();
        lock(&self.inbound_rx).take();

        if let Some(reader) = tasks.reader.take() {
            reader.abort();
            let _ = reader.await;
        }

        if let Some(mut writer) = tasks.writer.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
                debug!(channel = self.id, "Inbound drain timed out");
                writer.abort();
                let _ = writer.await;
            }
        }

        self.set_state(ChannelState::Closed);
        trace!(channel = self.id, "Channel resources released");
    }
}

/// Local socket -> DATA frames
async fn outbound_pump<R>(
    id: u16,
    mut reader: R,
    frames: FrameSender,
    events: mpsc::UnboundedSender<ChannelEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHANNEL_READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(ChannelEvent::LocalEof(id));
                return;
            }
            Ok(n) => {
                trace!(channel = id, bytes = n, "Local read");
                let frame = TunnelMessage::data(id, Bytes::copy_from_slice(&buf[..n]));
                if frames.send(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(ChannelEvent::LocalError(id, e.to_string()));
                return;
            }
        }
    }
}

/// Inbound DATA payloads -> local socket
async fn inbound_pump<W>(
    id: u16,
    mut writer: W,
    mut inbound: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = inbound.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            let _ = events.send(ChannelEvent::WriteFailed(id, e.to_string()));
            return;
        }
    }

    let _ = writer.shutdown().await;
}

/// Client-side channel: carries a SOCKS client's flow
pub struct ClientChannel {
    io: ChannelIo,
    target: ConnectRequest,
    waiter: Mutex<Option<oneshot::Sender<ConnectOutcome>>>,
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("id", &self.io.id)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl ClientChannel {
    pub(crate) fn new(
        id: u16,
        target: ConnectRequest,
        frames: FrameSender,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> (Self, oneshot::Receiver<ConnectOutcome>) {
        let (tx, rx) = oneshot::channel();
        let channel = Self {
            io: ChannelIo::new(id, frames, events),
            target,
            waiter: Mutex::new(Some(tx)),
        };
        (channel, rx)
    }

    pub fn target(&self) -> &ConnectRequest {
        &self.target
    }

    /// Deliver the peer's answer to the waiting opener
    ///
    /// Returns false if nobody is waiting any more.
    pub(crate) fn resolve(&self, outcome: ConnectOutcome) -> bool {
        let Some(waiter) = lock(&self.waiter).take() else {
            return false;
        };
        if outcome == ConnectOutcome::Established && !self.io.mark_open() {
            return false;
        }
        waiter.send(outcome).is_ok()
    }

    /// Start relaying between the tunnel and the accepted local socket
    pub async fn attach<S>(&self, stream: S) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.io.attach(stream, None).await
    }
}

#[async_trait]
impl Channel for ClientChannel {
    fn id(&self) -> u16 {
        self.io.id
    }

    fn state(&self) -> ChannelState {
        self.io.state()
    }

    fn deliver(&self, data: Bytes) -> Result<(), TunnelError> {
        self.io.deliver(data)
    }

    async fn close(&self) {
        lock(&self.waiter).take();
        self.io.close().await;
    }
}

/// Server-side channel: carries the flow to a real destination
pub struct ServerChannel {
    io: ChannelIo,
    target: ConnectRequest,
    strategy: Mutex<Option<Strategy>>,
}

impl ServerChannel {
    pub(crate) fn new(
        id: u16,
        target: ConnectRequest,
        frames: FrameSender,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            io: ChannelIo::new(id, frames, events),
            target,
            strategy: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &ConnectRequest {
        &self.target
    }

    /// Strategy that reached the destination, once connected
    pub fn strategy(&self) -> Option<Strategy> {
        lock(&self.strategy).clone()
    }

    /// Take ownership of the upstream socket, announce CONNECT_OK, start pumps
    pub(crate) async fn establish<S>(&self, upstream: S, strategy: Strategy) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        *lock(&self.strategy) = Some(strategy);
        self.io
            .attach(upstream, Some(TunnelMessage::connect_ok(self.io.id)))
            .await
    }
}

#[async_trait]
impl Channel for ServerChannel {
    fn id(&self) -> u16 {
        self.io.id
    }

    fn state(&self) -> ChannelState {
        self.io.state()
    }

    fn deliver(&self, data: Bytes) -> Result<(), TunnelError> {
        self.io.deliver(data)
    }

    async fn close(&self) {
        self.io.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{FrameSender, MessageType};

    fn harness() -> (
        FrameSender,
        mpsc::Receiver<TunnelMessage>,
        mpsc::UnboundedSender<ChannelEvent>,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let (frames, frames_rx) = FrameSender::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (frames, frames_rx, events_tx, events_rx)
    }

    #[tokio::test]
    async fn test_client_channel_lifecycle() {
        let (frames, mut frames_rx, events, mut events_rx) = harness();
        let (channel, outcome) = ClientChannel::new(4, ConnectRequest::new("example.com", 80), frames, events);

        assert_eq!(channel.state(), ChannelState::Pending);
        channel.deliver(Bytes::from_static(b"early ")).unwrap();

        assert!(channel.resolve(ConnectOutcome::Established));
        assert_eq!(outcome.await.unwrap(), ConnectOutcome::Established);
        assert!(channel.is_open());

        // Data arriving before the socket is attached is queued
        channel.deliver(Bytes::from_static(b"hello ")).unwrap();

        let (local, mut remote) = tokio::io::duplex(1024);
        channel.attach(local).await.unwrap();
        channel.deliver(Bytes::from_static(b"world")).unwrap();

        let mut got = vec![0u8; 17];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"early hello world");

        remote.write_all(b"reply").await.unwrap();
        let frame = frames_rx.recv().await.unwrap();
        assert_eq!(frame.msg_type, MessageType::Data);
        assert_eq!(frame.channel_id, 4);
        assert_eq!(&frame.payload[..], b"reply");

        drop(remote);
        assert!(matches!(events_rx.recv().await, Some(ChannelEvent::LocalEof(4))));

        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_close_flushes_queued_data() {
        let (frames, _frames_rx, events, _events_rx) = harness();
        let (channel, _outcome) = ClientChannel::new(1, ConnectRequest::new("h", 1), frames, events);
        channel.resolve(ConnectOutcome::Established);

        let (local, mut remote) = tokio::io::duplex(1024);
        channel.attach(local).await.unwrap();
        channel.deliver(Bytes::from_static(b"last words")).unwrap();
        channel.close().await;

        let mut got = Vec::new();
        remote.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got, b"last words");
    }

    #[tokio::test]
    async fn test_close_before_attach_rejects_socket() {
        let (frames, _frames_rx, events, _events_rx) = harness();
        let channel = ServerChannel::new(2, ConnectRequest::new("h", 1), frames, events);

        channel.close().await;
        let (local, _remote) = tokio::io::duplex(64);
        let result = channel.establish(local, Strategy::DefaultResolution).await;

        assert!(matches!(result, Err(TunnelError::ChannelClosed(2))));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_server_announces_before_data() {
        let (frames, mut frames_rx, events, _events_rx) = harness();
        let channel = ServerChannel::new(6, ConnectRequest::new("h", 1), frames, events);

        let (local, mut remote) = tokio::io::duplex(64);
        remote.write_all(b"banner").await.unwrap();
        channel.establish(local, Strategy::DefaultResolution).await.unwrap();

        let first = frames_rx.recv().await.unwrap();
        assert_eq!(first.msg_type, MessageType::ConnectOk);
        let second = frames_rx.recv().await.unwrap();
        assert_eq!(second.msg_type, MessageType::Data);
        assert_eq!(&second.payload[..], b"banner");
        assert_eq!(channel.strategy(), Some(Strategy::DefaultResolution));

        channel.close().await;
    }

    #[tokio::test]
    async fn test_server_buffers_data_while_connecting() {
        let (frames, _frames_rx, events, _events_rx) = harness();
        let channel = ServerChannel::new(5, ConnectRequest::new("h", 1), frames, events);

        channel.deliver(Bytes::from_static(b"EHLO ")).unwrap();
        channel.deliver(Bytes::from_static(b"early")).unwrap();

        let (local, mut remote) = tokio::io::duplex(64);
        channel.establish(local, Strategy::DefaultResolution).await.unwrap();

        let mut got = [0u8; 10];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"EHLO early");

        channel.close().await;
        assert!(matches!(
            channel.deliver(Bytes::from_static(b"late")),
            Err(TunnelError::ChannelClosed(5))
        ));
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let (frames, _frames_rx, events, _events_rx) = harness();
        let (channel, outcome) = ClientChannel::new(9, ConnectRequest::new("h", 1), frames, events);

        assert!(channel.resolve(ConnectOutcome::Refused("no route".to_string())));
        assert_eq!(outcome.await.unwrap(), ConnectOutcome::Refused("no route".to_string()));
        assert_eq!(channel.state(), ChannelState::Pending);

        // Second answer has nobody to go to
        assert!(!channel.resolve(ConnectOutcome::Established));
    }

    #[tokio::test]
    async fn test_stalled_socket_overflows() {
        let (frames, _frames_rx, events, _events_rx) = harness();
        let (channel, _outcome) = ClientChannel::new(3, ConnectRequest::new("h", 1), frames, events);
        channel.resolve(ConnectOutcome::Established);

        for _ in 0..INBOUND_QUEUE_DEPTH {
            channel.deliver(Bytes::from_static(b"x")).unwrap();
        }
        assert!(matches!(
            channel.deliver(Bytes::from_static(b"x")),
            Err(TunnelError::ChannelStalled(3))
        ));
    }
}
