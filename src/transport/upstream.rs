//! Outbound connections to CONNECT destinations
//!
//! Strategies are tried in a fixed order until one connects:
//! native IPv6, default resolution, explicit IPv4, the static fallback
//! pool (IPv6 literals only) and finally the alternate resolver. Every attempt is bounded by
//! the per-attempt timeout and tallied in [`ConnectStats`].

use crate::protocol::UPSTREAM_ATTEMPT_TIMEOUT;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

#[cfg(feature = "alt-resolver")]
use super::AlternateResolver;

/// How a destination was reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// IPv6 literal dialed directly
    NativeIpv6(Ipv6Addr),
    /// First address returned by the system resolver
    DefaultResolution,
    /// Another A record from the system resolver
    ExplicitIpv4(Ipv4Addr),
    /// Static address pool, for IPv6 literals with no IPv4 route
    FallbackPool(Ipv4Addr),
    /// A record from the alternate resolver
    AlternateResolver(Ipv4Addr),
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::NativeIpv6(_) => StrategyKind::NativeIpv6,
            Strategy::DefaultResolution => StrategyKind::DefaultResolution,
            Strategy::ExplicitIpv4(_) => StrategyKind::ExplicitIpv4,
            Strategy::FallbackPool(_) => StrategyKind::FallbackPool,
            Strategy::AlternateResolver(_) => StrategyKind::AlternateResolver,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::NativeIpv6(ip) => write!(f, "native-ipv6 [{}]", ip),
            Strategy::DefaultResolution => write!(f, "default-resolution"),
            Strategy::ExplicitIpv4(ip) => write!(f, "explicit-ipv4 {}", ip),
            Strategy::FallbackPool(ip) => write!(f, "fallback-pool {}", ip),
            Strategy::AlternateResolver(ip) => write!(f, "alternate-resolver {}", ip),
        }
    }
}

/// Strategy without its address, for counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    NativeIpv6,
    DefaultResolution,
    ExplicitIpv4,
    FallbackPool,
    AlternateResolver,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::NativeIpv6,
        StrategyKind::DefaultResolution,
        StrategyKind::ExplicitIpv4,
        StrategyKind::FallbackPool,
        StrategyKind::AlternateResolver,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::NativeIpv6 => "native_ipv6",
            StrategyKind::DefaultResolution => "default",
            StrategyKind::ExplicitIpv4 => "ipv4",
            StrategyKind::FallbackPool => "fallback_pool",
            StrategyKind::AlternateResolver => "alt_resolver",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct Tally {
    success: AtomicU64,
    failure: AtomicU64,
}

/// Per-strategy connect counters
#[derive(Default)]
pub struct ConnectStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    per_kind: [Tally; 5],
}

impl ConnectStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_attempt(&self, kind: StrategyKind, ok: bool) {
        let tally = &self.per_kind[kind.index()];
        if ok {
            tally.success.fetch_add(1, Ordering::Relaxed);
        } else {
            tally.failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_request(&self, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// CONNECT requests handled
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// (successes, failures) for one strategy
    pub fn attempts(&self, kind: StrategyKind) -> (u64, u64) {
        let tally = &self.per_kind[kind.index()];
        (
            tally.success.load(Ordering::Relaxed),
            tally.failure.load(Ordering::Relaxed),
        )
    }
}

impl fmt::Display for ConnectStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} ok={} failed={}",
            self.total(),
            self.succeeded(),
            self.failed()
        )?;
        for kind in StrategyKind::ALL {
            let (ok, failed) = self.attempts(kind);
            if ok + failed > 0 {
                write!(f, " {}={}/{}", kind.name(), ok, failed)?;
            }
        }
        Ok(())
    }
}

/// Every strategy failed for a destination
#[derive(Debug)]
pub struct ConnectError {
    pub host: String,
    pub port: u16,
    pub attempts: Vec<(StrategyKind, String)>,
}

impl ConnectError {
    /// Short reason suitable for CONNECT_FAIL
    pub fn reason(&self) -> String {
        match self.attempts.last() {
            Some((kind, err)) => format!("{}: {}", kind.name(), err),
            None => "no usable address".to_string(),
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cannot reach {}:{}", self.host, self.port)?;
        for (kind, err) in &self.attempts {
            write!(f, "; {}: {}", kind.name(), err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConnectError {}

/// Upstream connector settings
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Bound on each individual connect attempt
    pub attempt_timeout: Duration,
    /// Override IPv6 detection
    pub ipv6_supported: Option<bool>,
    /// Static IPv4 pool per service, tried in key order
    pub ipv4_fallback: BTreeMap<String, Vec<Ipv4Addr>>,
    /// Resolver queried as the last strategy; `None` disables it
    pub alternate_resolver: Option<SocketAddr>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: UPSTREAM_ATTEMPT_TIMEOUT,
            ipv6_supported: None,
            ipv4_fallback: default_ipv4_fallback(),
            alternate_resolver: None,
        }
    }
}

/// Built-in fallback pool
///
/// Keys only label the entries. The pool is consulted for IPv6 literal
/// targets that could not be reached and have no IPv4 address, never to
/// redirect a domain.
pub fn default_ipv4_fallback() -> BTreeMap<String, Vec<Ipv4Addr>> {
    const TABLE: &[(&str, &[[u8; 4]])] = &[
        ("google.com", &[[142, 250, 72, 174], [142, 250, 72, 175], [142, 250, 72, 176]]),
        ("www.google.com", &[[142, 250, 72, 174], [142, 250, 72, 175]]),
        ("cloudflare.com", &[[104, 16, 132, 229], [104, 16, 133, 229]]),
        ("www.cloudflare.com", &[[104, 16, 132, 229], [104, 16, 133, 229]]),
        ("facebook.com", &[[157, 240, 22, 35], [157, 240, 22, 19]]),
        ("www.facebook.com", &[[157, 240, 22, 35], [157, 240, 22, 19]]),
        ("apple.com", &[[17, 253, 144, 10], [17, 253, 144, 11]]),
        ("www.apple.com", &[[17, 253, 144, 10], [17, 253, 144, 11]]),
    ];

    TABLE
        .iter()
        .map(|(host, addrs)| {
            (
                host.to_string(),
                addrs.iter().map(|o| Ipv4Addr::from(*o)).collect(),
            )
        })
        .collect()
}

/// Clean up host strings the way clients tend to mangle IPv6 literals
///
/// Strips surrounding brackets, collapses runs of colons to `::` and keeps
/// only the first `::`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if !host.contains("::") {
        return host.to_string();
    }

    let mut collapsed = String::with_capacity(host.len());
    let mut colons = 0;
    for c in host.chars() {
        if c == ':' {
            colons += 1;
            if colons <= 2 {
                collapsed.push(c);
            }
        } else {
            colons = 0;
            collapsed.push(c);
        }
    }

    match collapsed.find("::") {
        Some(first) => {
            let (head, tail) = collapsed.split_at(first + 2);
            format!("{}{}", head, tail.replace("::", ":"))
        }
        None => collapsed,
    }
}

/// Whether this host can open IPv6 sockets with a route out
fn detect_ipv6() -> bool {
    let Ok(socket) = std::net::UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)) else {
        return false;
    };
    socket
        .connect((Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888), 53))
        .is_ok()
}

/// Opens TCP connections to CONNECT destinations
pub struct UpstreamConnector {
    config: UpstreamConfig,
    ipv6_supported: bool,
    stats: Arc<ConnectStats>,
    #[cfg(feature = "alt-resolver")]
    resolver: Option<AlternateResolver>,
}

impl UpstreamConnector {
    pub fn new(config: UpstreamConfig) -> Self {
        let ipv6_supported = config.ipv6_supported.unwrap_or_else(detect_ipv6);
        debug!(ipv6 = ipv6_supported, "Upstream connector ready");

        Self {
            #[cfg(feature = "alt-resolver")]
            resolver: config
                .alternate_resolver
                .map(|server| AlternateResolver::new(server, config.attempt_timeout)),
            ipv6_supported,
            stats: Arc::new(ConnectStats::new()),
            config,
        }
    }

    pub fn stats(&self) -> Arc<ConnectStats> {
        Arc::clone(&self.stats)
    }

    pub fn ipv6_supported(&self) -> bool {
        self.ipv6_supported
    }

    /// Connect to `host:port`, trying each strategy in turn
    pub async fn connect(&self, host: &str, port: u16) -> Result<(TcpStream, Strategy), ConnectError> {
        let result = self.try_strategies(host, port).await;
        self.stats.record_request(result.is_ok());
        result
    }

    async fn try_strategies(&self, raw_host: &str, port: u16) -> Result<(TcpStream, Strategy), ConnectError> {
        let host = normalize_host(raw_host);
        let mut attempts = Vec::new();
        let mut tried: HashSet<IpAddr> = HashSet::new();

        // (a) IPv6 literal
        if let Ok(v6) = host.parse::<Ipv6Addr>() {
            if self.ipv6_supported {
                let addr = SocketAddr::new(IpAddr::V6(v6), port);
                tried.insert(addr.ip());
                match self.attempt(StrategyKind::NativeIpv6, addr).await {
                    Ok(stream) => return Ok((stream, Strategy::NativeIpv6(v6))),
                    Err(e) => attempts.push((StrategyKind::NativeIpv6, e)),
                }
            } else {
                attempts.push((StrategyKind::NativeIpv6, "IPv6 not available".to_string()));
            }
        } else {
            // (b) system resolution, (c) the rest of its A records
            let is_v4_literal = host.parse::<Ipv4Addr>().is_ok();
            match self.lookup(&host, port).await {
                Ok(addrs) => {
                    let mut addrs = addrs.into_iter();
                    if let Some(first) = addrs.next() {
                        tried.insert(first.ip());
                        match self.attempt(StrategyKind::DefaultResolution, first).await {
                            Ok(stream) => return Ok((stream, Strategy::DefaultResolution)),
                            Err(e) => attempts.push((StrategyKind::DefaultResolution, e)),
                        }
                    }

                    if !is_v4_literal {
                        for addr in addrs {
                            let IpAddr::V4(v4) = addr.ip() else { continue };
                            if !tried.insert(addr.ip()) {
                                continue;
                            }
                            match self.attempt(StrategyKind::ExplicitIpv4, addr).await {
                                Ok(stream) => return Ok((stream, Strategy::ExplicitIpv4(v4))),
                                Err(e) => attempts.push((StrategyKind::ExplicitIpv4, e)),
                            }
                        }
                    }
                }
                Err(e) => attempts.push((StrategyKind::DefaultResolution, e)),
            }
        }

        // (d) static pool, only for an IPv6 literal that has no IPv4 route
        if host.parse::<Ipv6Addr>().is_ok() {
            for (service, pool) in &self.config.ipv4_fallback {
                for &v4 in pool {
                    if !tried.insert(IpAddr::V4(v4)) {
                        continue;
                    }
                    trace!(%service, "Trying fallback pool");
                    let addr = SocketAddr::new(IpAddr::V4(v4), port);
                    match self.attempt(StrategyKind::FallbackPool, addr).await {
                        Ok(stream) => return Ok((stream, Strategy::FallbackPool(v4))),
                        Err(e) => attempts.push((StrategyKind::FallbackPool, e)),
                    }
                }
            }
        }

        // (e) alternate resolver, domains only
        if host.parse::<IpAddr>().is_err() {
            if let Some(found) = self.try_alternate(&host, port, &mut tried, &mut attempts).await {
                return Ok(found);
            }
        }

        Err(ConnectError {
            host,
            port,
            attempts,
        })
    }

    #[cfg(feature = "alt-resolver")]
    async fn try_alternate(
        &self,
        host: &str,
        port: u16,
        tried: &mut HashSet<IpAddr>,
        attempts: &mut Vec<(StrategyKind, String)>,
    ) -> Option<(TcpStream, Strategy)> {
        let resolver = self.resolver.as_ref()?;
        let addrs = match resolver.resolve_ipv4(host).await {
            Ok(addrs) => addrs,
            Err(e) => {
                attempts.push((StrategyKind::AlternateResolver, e.to_string()));
                return None;
            }
        };

        for v4 in addrs {
            if !tried.insert(IpAddr::V4(v4)) {
                continue;
            }
            let addr = SocketAddr::new(IpAddr::V4(v4), port);
            match self.attempt(StrategyKind::AlternateResolver, addr).await {
                Ok(stream) => return Some((stream, Strategy::AlternateResolver(v4))),
                Err(e) => attempts.push((StrategyKind::AlternateResolver, e)),
            }
        }
        None
    }

    #[cfg(not(feature = "alt-resolver"))]
    async fn try_alternate(
        &self,
        _host: &str,
        _port: u16,
        _tried: &mut HashSet<IpAddr>,
        _attempts: &mut Vec<(StrategyKind, String)>,
    ) -> Option<(TcpStream, Strategy)> {
        None
    }

    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, String> {
        match tokio::time::timeout(self.config.attempt_timeout, tokio::net::lookup_host((host, port))).await {
            Ok(Ok(addrs)) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    Err("no addresses".to_string())
                } else {
                    Ok(addrs)
                }
            }
            Ok(Err(e)) => Err(format!("resolve failed: {}", e)),
            Err(_) => Err("resolve timed out".to_string()),
        }
    }

    async fn attempt(&self, kind: StrategyKind, addr: SocketAddr) -> Result<TcpStream, String> {
        trace!(strategy = kind.name(), %addr, "Connect attempt");

        let result = match tokio::time::timeout(self.config.attempt_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timed out".to_string()),
        };

        self.stats.record_attempt(kind, result.is_ok());
        if let Err(e) = &result {
            debug!(strategy = kind.name(), %addr, "Connect attempt failed: {}", e);
        }
        result
    }
}
