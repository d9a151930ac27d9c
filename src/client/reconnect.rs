//! Reconnect supervision for the client role
//!
//! [`ReconnectSupervisor`] keeps one tunnel connection up at a time. A
//! failed attempt backs off exponentially; a connection that stayed up
//! long enough resets the backoff. Channel opens are reported back so a
//! tunnel whose transport is alive but whose upstream connects keep
//! failing gets torn down and rebuilt.

use crate::tunnel::{ClientChannel, ClientMultiplexer, TunnelError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Produces a fresh tunnel connection
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(&self) -> crate::Result<ClientMultiplexer>;
}

/// Backoff and zombie-detection settings
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Channel failures within `failure_window` that force a reconnect
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// Uptime after which a dropped connection counts as healthy
    pub healthy_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            healthy_after: Duration::from_secs(10),
        }
    }
}

/// Snapshot of reconnect activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectStats {
    /// Connection attempts after the first one
    pub total_reconnects: u64,
    pub successful_reconnects: u64,
    /// Channel opens failed since the last successful one
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
    /// Delay before the next attempt should this one fail
    pub current_delay: Duration,
    pub reconnecting: bool,
}

impl fmt::Display for ReconnectStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reconnects={} ok={} channel_failures={} delay={:?}",
            self.total_reconnects,
            self.successful_reconnects,
            self.consecutive_failures,
            self.current_delay
        )?;
        if let Some(reason) = &self.last_failure {
            write!(f, " last_failure={:?}", reason)?;
        }
        Ok(())
    }
}

/// Backoff and failure-window bookkeeping, free of any I/O
#[derive(Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    current_delay: Duration,
    attempts: u64,
    successes: u64,
    consecutive_failures: u32,
    last_failure: Option<String>,
    failures: VecDeque<Instant>,
    reconnecting: bool,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current_delay: policy.initial_delay,
            attempts: 0,
            successes: 0,
            consecutive_failures: 0,
            last_failure: None,
            failures: VecDeque::new(),
            reconnecting: false,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// A connection attempt is starting
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.reconnecting = true;
    }

    /// The attempt failed; returns how long to wait before the next one
    pub fn on_connect_failure(&mut self, reason: impl Into<String>) -> Duration {
        self.reconnecting = false;
        self.last_failure = Some(reason.into());
        self.back_off()
    }

    /// The attempt produced a working tunnel
    pub fn on_connected(&mut self) {
        self.reconnecting = false;
        if self.attempts > 1 {
            self.successes += 1;
        }
        self.failures.clear();
    }

    /// The tunnel went away after `uptime`
    ///
    /// Returns the wait before reconnecting, or `None` to reconnect at once.
    pub fn on_disconnect(&mut self, uptime: Duration) -> Option<Duration> {
        self.failures.clear();
        if uptime >= self.policy.healthy_after {
            self.current_delay = self.policy.initial_delay;
            None
        } else {
            Some(self.back_off())
        }
    }

    /// Record a failed channel open; true when the tunnel should be rebuilt
    pub fn record_channel_failure(&mut self, reason: impl Into<String>, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(reason.into());

        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > self.policy.failure_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);

        self.failures.len() >= self.policy.failure_threshold as usize
    }

    /// Record a successful channel open
    pub fn record_channel_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.failures.clear();
    }

    /// Failures currently inside the sliding window
    pub fn failures_in_window(&self) -> usize {
        self.failures.len()
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn stats(&self) -> ReconnectStats {
        ReconnectStats {
            total_reconnects: self.attempts.saturating_sub(1),
            successful_reconnects: self.successes,
            consecutive_failures: self.consecutive_failures,
            last_failure: self.last_failure.clone(),
            current_delay: self.current_delay,
            reconnecting: self.reconnecting,
        }
    }

    fn back_off(&mut self) -> Duration {
        let delay = self.current_delay;
        self.current_delay = (self.current_delay * 2).min(self.policy.max_delay);
        delay
    }
}

struct Shared {
    state: Mutex<ReconnectState>,
    current: watch::Sender<Option<ClientMultiplexer>>,
    zombie: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ReconnectState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a tunnel connection up and rebuilds it when it fails
pub struct ReconnectSupervisor<C> {
    connector: C,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl<C: TunnelConnector> ReconnectSupervisor<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        let (current, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        Self {
            connector,
            shared: Arc::new(Shared {
                state: Mutex::new(ReconnectState::new(policy)),
                current,
                zombie: Notify::new(),
            }),
            shutdown,
        }
    }

    /// Handle for opening channels over whichever connection is current
    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            current: self.shared.current.subscribe(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stats(&self) -> ReconnectStats {
        self.shared.state().stats()
    }

    /// Ask [`run`](Self::run) to tear the connection down and return
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Connect, supervise and reconnect until shut down
    pub async fn run(&self) {
        let mut stop = self.shutdown.subscribe();

        while !*stop.borrow() {
            self.shared.state().begin_attempt();

            let attempt = tokio::select! {
                result = self.connector.connect() => result,
                _ = stop.wait_for(|stop| *stop) => break,
            };

            let mux = match attempt {
                Ok(mux) => mux,
                Err(e) => {
                    let delay = self.shared.state().on_connect_failure(e.to_string());
                    warn!("Connection failed: {}; retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = stop.wait_for(|stop| *stop) => break,
                    }
                }
            };

            let zombie = self.shared.zombie.notified();
            tokio::pin!(zombie);
            zombie.as_mut().enable();

            let started = Instant::now();
            self.shared.state().on_connected();
            self.shared.current.send_replace(Some(mux.clone()));
            info!("Tunnel connected");

            let stopping = tokio::select! {
                reason = mux.closed() => {
                    info!("Tunnel connection lost: {}", reason.as_deref().unwrap_or("closed by peer"));
                    false
                }
                _ = &mut zombie => {
                    warn!("Channel opens keep failing on a live tunnel, reconnecting");
                    false
                }
                _ = stop.wait_for(|stop| *stop) => true,
            };

            // Every channel is released before a new connection starts
            self.shared.current.send_replace(None);
            mux.shutdown().await;
            if stopping {
                break;
            }

            let delay = self.shared.state().on_disconnect(started.elapsed());
            if let Some(delay) = delay {
                debug!("Connection was short-lived, waiting {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.wait_for(|stop| *stop) => break,
                }
            }
        }

        self.shared.current.send_replace(None);
        info!("Reconnect supervisor stopped ({})", self.stats());
    }
}

/// Cloneable entry point for the local front end
#[derive(Clone)]
pub struct TunnelHandle {
    current: watch::Receiver<Option<ClientMultiplexer>>,
    shared: Arc<Shared>,
}

impl TunnelHandle {
    /// Current connection, if one is up
    pub fn current(&self) -> Option<ClientMultiplexer> {
        self.current.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|mux| !mux.is_closed())
    }

    /// Wait up to `limit` for a connection to come up
    pub async fn wait_connected(&self, limit: Duration) -> Option<ClientMultiplexer> {
        let mut current = self.current.clone();
        let ready = tokio::time::timeout(limit, current.wait_for(|mux| mux.is_some())).await;
        match ready {
            Ok(Ok(mux)) => mux.clone(),
            _ => None,
        }
    }

    /// Open a channel and feed the outcome to zombie detection
    pub async fn open_channel(&self, host: &str, port: u16) -> Result<Arc<ClientChannel>, TunnelError> {
        let mux = self.current().ok_or(TunnelError::ConnectionClosed)?;
        let result = mux.open_channel(host, port).await;

        match &result {
            Ok(_) => self.shared.state().record_channel_success(),
            Err(e @ (TunnelError::ConnectFailed(_) | TunnelError::ConnectTimeout)) => {
                let rebuild = self.shared.state().record_channel_failure(e.to_string(), Instant::now());
                if rebuild {
                    self.shared.zombie.notify_waiters();
                }
            }
            Err(_) => {}
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{FrameCodec, MessageType, MuxConfig, TunnelMessage};
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn policy(initial: u64, max: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_secs(initial),
            max_delay: Duration::from_secs(max),
            failure_threshold: 3,
            failure_window: Duration::from_secs(30),
            healthy_after: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let mut state = ReconnectState::new(policy(1, 30));

        let delays: Vec<u64> = (0..7)
            .map(|_| {
                state.begin_attempt();
                state.on_connect_failure("refused").as_secs()
            })
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        state.begin_attempt();
        state.on_connected();
        assert_eq!(state.on_disconnect(Duration::from_secs(60)), None);
        assert_eq!(state.current_delay(), Duration::from_secs(1));

        state.begin_attempt();
        assert_eq!(state.on_connect_failure("refused"), Duration::from_secs(1));
    }

    #[test]
    fn test_short_lived_connection_keeps_backing_off() {
        let mut state = ReconnectState::new(policy(1, 30));

        state.begin_attempt();
        state.on_connect_failure("refused");
        state.begin_attempt();
        state.on_connected();

        assert_eq!(state.on_disconnect(Duration::from_secs(1)), Some(Duration::from_secs(2)));
        assert_eq!(state.current_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_failure_threshold() {
        let mut state = ReconnectState::new(policy(1, 30));
        let now = Instant::now();

        assert!(!state.record_channel_failure("a", now));
        assert!(!state.record_channel_failure("b", now));
        assert!(state.record_channel_failure("c", now));

        let stats = state.stats();
        assert_eq!(stats.consecutive_failures, 3);
        assert_eq!(stats.last_failure.as_deref(), Some("c"));
    }

    #[test]
    fn test_success_resets_failures() {
        let mut state = ReconnectState::new(policy(1, 30));
        let now = Instant::now();

        state.record_channel_failure("a", now);
        state.record_channel_failure("b", now);
        state.record_channel_success();

        let stats = state.stats();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.last_failure, None);
        assert!(!state.record_channel_failure("c", now));
    }

    #[test]
    fn test_sliding_window() {
        let mut state = ReconnectState::new(policy(1, 30));
        let start = Instant::now();

        state.record_channel_failure("a", start);
        state.record_channel_failure("b", start);
        assert_eq!(state.failures_in_window(), 2);

        assert!(!state.record_channel_failure("c", start + Duration::from_secs(31)));
        assert_eq!(state.failures_in_window(), 1);
        assert_eq!(state.stats().consecutive_failures, 3);
    }

    #[test]
    fn test_stats() {
        let mut state = ReconnectState::new(policy(2, 30));
        assert_eq!(state.stats(), ReconnectStats {
            current_delay: Duration::from_secs(2),
            ..ReconnectStats::default()
        });

        state.begin_attempt();
        assert!(state.stats().reconnecting);
        state.on_connected();
        state.on_disconnect(Duration::from_secs(60));
        state.begin_attempt();
        state.on_connect_failure("timeout");
        state.begin_attempt();
        state.on_connected();

        let stats = state.stats();
        assert_eq!(stats.total_reconnects, 2);
        assert_eq!(stats.successful_reconnects, 1);
        assert!(!stats.reconnecting);
        assert!(stats.to_string().starts_with("reconnects=2 ok=1"));
    }

    /// Hands out multiplexers over in-memory streams; the far ends are kept
    /// so tests can play the server
    struct FakeConnector {
        fail_first: usize,
        calls: AtomicUsize,
        peers: tokio::sync::mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl TunnelConnector for FakeConnector {
        async fn connect(&self) -> crate::Result<ClientMultiplexer> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(crate::Error::ConnectionClosed);
            }
            let (near, far) = tokio::io::duplex(64 * 1024);
            let _ = self.peers.send(far);
            Ok(ClientMultiplexer::start(near, BytesMut::new(), MuxConfig::default(), None))
        }
    }

    fn supervisor(fail_first: usize) -> (
        Arc<ReconnectSupervisor<FakeConnector>>,
        tokio::sync::mpsc::UnboundedReceiver<DuplexStream>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let connector = FakeConnector {
            fail_first,
            calls: AtomicUsize::new(0),
            peers: tx,
        };
        (Arc::new(ReconnectSupervisor::new(connector, policy(1, 30))), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_connected() {
        let (sup, mut peers) = supervisor(3);
        let handle = sup.handle();
        let task = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run().await }
        });

        let start = Instant::now();
        let _peer = peers.recv().await.unwrap();
        assert!(handle.wait_connected(Duration::from_secs(1)).await.is_some());
        // 1 + 2 + 4 seconds of backoff
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(sup.stats().total_reconnects, 3);

        sup.shutdown();
        task.await.unwrap();
        assert!(handle.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_drop() {
        let (sup, mut peers) = supervisor(0);
        let handle = sup.handle();
        let task = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run().await }
        });

        let first = peers.recv().await.unwrap();
        let first_mux = handle.wait_connected(Duration::from_secs(1)).await.unwrap();
        drop(first);

        let _second = peers.recv().await.unwrap();
        assert!(first_mux.is_closed());
        assert_eq!(sup.stats().successful_reconnects, 1);

        sup.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zombie_tunnel_rebuilt() {
        let (sup, mut peers) = supervisor(0);
        let handle = sup.handle();
        let task = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run().await }
        });

        // Plays a server that refuses every CONNECT
        let mut far = peers.recv().await.unwrap();
        handle.wait_connected(Duration::from_secs(1)).await.unwrap();
        let refuser = tokio::spawn(async move {
            let codec = FrameCodec::default();
            let mut buf = BytesMut::new();
            loop {
                while let Some((msg, used)) = codec.decode(&buf).unwrap() {
                    let _ = buf.split_to(used);
                    if msg.msg_type == MessageType::Connect {
                        let reply = TunnelMessage::connect_fail(msg.channel_id, "unreachable");
                        far.write_all(&reply.encode().unwrap()).await.unwrap();
                    }
                }
                if far.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
            }
        });

        for _ in 0..3 {
            let err = handle.open_channel("example.com", 80).await.unwrap_err();
            assert!(matches!(err, TunnelError::ConnectFailed(_)));
        }

        let _second = peers.recv().await.unwrap();
        refuser.await.unwrap();
        assert_eq!(sup.stats().consecutive_failures, 3);

        sup.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_without_connection() {
        let (sup, _peers) = supervisor(usize::MAX);
        let handle = sup.handle();

        assert!(!handle.is_connected());
        assert!(matches!(
            handle.open_channel("example.com", 80).await,
            Err(TunnelError::ConnectionClosed)
        ));
    }
}
