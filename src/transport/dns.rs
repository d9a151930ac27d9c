//! Alternate DNS resolver
//!
//! Last-resort A-record lookup sent straight to a fixed public resolver
//! over UDP, for destinations the system resolver cannot see.

use super::TransportError;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::trace;

/// Record type A
const QTYPE_A: u16 = 1;

/// Class IN
const QCLASS_IN: u16 = 1;

/// Default resolver (Google Public DNS)
pub const DEFAULT_RESOLVER: &str = "8.8.8.8:53";

/// Resolves A records through one fixed DNS server
#[derive(Debug, Clone)]
pub struct AlternateResolver {
    server: SocketAddr,
    timeout: Duration,
    max_retries: u32,
}

impl AlternateResolver {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self {
            server,
            timeout,
            max_retries: 2,
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Look up the IPv4 addresses of `host`
    ///
    /// Retries share the resolver timeout; the whole lookup never takes
    /// longer than one connect attempt.
    pub async fn resolve_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, TransportError> {
        timeout(self.timeout, self.query(host))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn query(&self, host: &str) -> Result<Vec<Ipv4Addr>, TransportError> {
        let tx_id: u16 = rand::random();
        let packet = build_query(tx_id, host)?;

        let bind_addr = if self.server.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.server).await?;

        let per_try = self.timeout / self.max_retries.max(1);
        for attempt in 0..self.max_retries {
            socket.send(&packet).await?;

            let mut buf = [0u8; 512];
            match timeout(per_try, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    let addrs = parse_response(tx_id, &buf[..len])?;
                    trace!("{} resolved to {:?} via {}", host, addrs, self.server);
                    return Ok(addrs);
                }
                Ok(Err(e)) => {
                    if attempt + 1 >= self.max_retries {
                        return Err(TransportError::Io(e));
                    }
                }
                Err(_) => trace!("No answer from {} (try {})", self.server, attempt + 1),
            }
        }

        Err(TransportError::Timeout)
    }
}

/// Build a recursive A query for `qname`
fn build_query(tx_id: u16, qname: &str) -> Result<Vec<u8>, TransportError> {
    let qname = qname.trim_end_matches('.');
    if qname.is_empty() || qname.len() > 253 {
        return Err(TransportError::Dns(format!("invalid name length {}", qname.len())));
    }

    let mut packet = Vec::with_capacity(18 + qname.len());

    // Transaction ID
    packet.extend_from_slice(&tx_id.to_be_bytes());
    // Flags: standard query, recursion desired
    packet.extend_from_slice(&[0x01, 0x00]);
    // QDCOUNT 1, ANCOUNT 0, NSCOUNT 0, ARCOUNT 0
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in qname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(TransportError::Dns(format!("invalid label in {}", qname)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0); // Root label

    packet.extend_from_slice(&QTYPE_A.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Skip a possibly compressed name starting at `pos`
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len >= 0xC0 {
            // Compression pointer
            return Some(pos + 2);
        }
        pos += len + 1;
    }
}

/// Extract A records from a response to query `tx_id`
fn parse_response(tx_id: u16, packet: &[u8]) -> Result<Vec<Ipv4Addr>, TransportError> {
    if packet.len() < 12 {
        return Err(TransportError::Dns("Response too short".to_string()));
    }

    if u16::from_be_bytes([packet[0], packet[1]]) != tx_id {
        return Err(TransportError::Dns("Transaction ID mismatch".to_string()));
    }

    // RCODE in lower 4 bits of byte 3
    let rcode = packet[3] & 0x0F;
    if rcode != 0 {
        return Err(TransportError::Dns(format!("DNS error: RCODE={}", rcode)));
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let ancount = u16::from_be_bytes([packet[6], packet[7]]) as usize;

    let truncated = || TransportError::Dns("Truncated response".to_string());

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos).ok_or_else(truncated)? + 4; // QTYPE, QCLASS
    }

    let mut addrs = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(packet, pos).ok_or_else(truncated)?;
        if pos + 10 > packet.len() {
            return Err(truncated());
        }

        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;

        if pos + rdlength > packet.len() {
            return Err(truncated());
        }

        if rtype == QTYPE_A && rclass == QCLASS_IN && rdlength == 4 {
            addrs.push(Ipv4Addr::new(
                packet[pos],
                packet[pos + 1],
                packet[pos + 2],
                packet[pos + 3],
            ));
        }

        pos += rdlength;
    }

    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(tx_id: u16, query: &[u8], answers: &[[u8; 4]], cname_first: bool) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&tx_id.to_be_bytes());
        packet.extend_from_slice(&[0x81, 0x80]);
        packet.extend_from_slice(&[0x00, 0x01]);
        let count = answers.len() as u16 + cname_first as u16;
        packet.extend_from_slice(&count.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0]);
        packet.extend_from_slice(&query[12..]);

        if cname_first {
            // CNAME pointing at a short name, compressed owner
            packet.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x05, 0x00, 0x01, 0, 0, 0, 60, 0x00, 0x04]);
            packet.extend_from_slice(&[1, b'x', 0xC0, 0x0C]);
        }
        for ip in answers {
            packet.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01, 0, 0, 0, 60, 0x00, 0x04]);
            packet.extend_from_slice(ip);
        }
        packet
    }

    #[test]
    fn test_build_query() {
        let query = build_query(0x1234, "example.com").unwrap();

        assert_eq!(&query[..2], &[0x12, 0x34]);
        assert_eq!(&query[12..25], b"\x07example\x03com\x00");
        assert_eq!(&query[25..], &[0x00, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_build_query_rejects_bad_names() {
        assert!(build_query(1, "").is_err());
        assert!(build_query(1, "a..b").is_err());
        assert!(build_query(1, &format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_parse_a_records() {
        let query = build_query(7, "example.com").unwrap();
        let packet = response(7, &query, &[[93, 184, 216, 34], [93, 184, 216, 35]], true);

        let addrs = parse_response(7, &packet).unwrap();
        assert_eq!(
            addrs,
            vec![Ipv4Addr::new(93, 184, 216, 34), Ipv4Addr::new(93, 184, 216, 35)]
        );
    }

    #[test]
    fn test_parse_rejects_mismatch_and_errors() {
        let query = build_query(7, "example.com").unwrap();
        let packet = response(7, &query, &[[1, 2, 3, 4]], false);
        assert!(parse_response(8, &packet).is_err());

        let mut nx = packet.clone();
        nx[3] = 0x83; // NXDOMAIN
        assert!(parse_response(7, &nx).is_err());

        assert!(parse_response(7, &packet[..packet.len() - 2]).is_err());
    }

    #[tokio::test]
    async fn test_resolve_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let tx_id = u16::from_be_bytes([buf[0], buf[1]]);
            let reply = response(tx_id, &buf[..len], &[[10, 0, 0, 1]], false);
            server.send_to(&reply, peer).await.unwrap();
        });

        let resolver = AlternateResolver::new(addr, Duration::from_secs(2));
        let addrs = resolver.resolve_ipv4("tunnel.test").await.unwrap();
        assert_eq!(addrs, vec![Ipv4Addr::new(10, 0, 0, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_bounded_by_timeout() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let resolver = AlternateResolver::new(addr, Duration::from_secs(10));
        let started = tokio::time::Instant::now();
        let result = resolver.resolve_ipv4("quiet.test").await;

        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(started.elapsed() <= Duration::from_secs(10));

        // Both tries went out within that budget
        let mut buf = [0u8; 512];
        for _ in 0..2 {
            let (len, _) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 1);
            assert!(len > 12);
        }
    }
}
