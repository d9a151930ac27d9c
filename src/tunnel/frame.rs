//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +---------+--------+-------------------+-------------------+
//! | Version |  Type  |  Channel ID (2B)  |  Length (2B)      |
//! +---------+--------+-------------------+-------------------+
//! |                   Payload (Length bytes)                 |
//! +----------------------------------------------------------+
//! ```
//!
//! All integers are big-endian. A CONNECT payload is
//! `host_len:u8, host:[u8; host_len], port:u16`.

use crate::protocol::{
    ProtocolError, FRAME_HEADER_SIZE, MAX_BUFFER_SIZE, MAX_HOST_LEN, MAX_PAYLOAD_SIZE,
    MAX_REASON_LEN, PROTOCOL_VERSION,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Channel payload bytes
    Data = 0x01,
    /// Open a channel to host:port
    Connect = 0x02,
    /// Upstream connection established
    ConnectOk = 0x03,
    /// Upstream connection failed, payload is a short reason
    ConnectFail = 0x04,
    /// Channel closed
    Close = 0x05,
    /// Liveness check (channel 0)
    Keepalive = 0x06,
    /// Liveness check answer (channel 0)
    KeepaliveAck = 0x07,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Data),
            0x02 => Ok(MessageType::Connect),
            0x03 => Ok(MessageType::ConnectOk),
            0x04 => Ok(MessageType::ConnectFail),
            0x05 => Ok(MessageType::Close),
            0x06 => Ok(MessageType::Keepalive),
            0x07 => Ok(MessageType::KeepaliveAck),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

/// A tunnel protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelMessage {
    /// Message type
    pub msg_type: MessageType,
    /// Channel ID (0 for connection-level messages)
    pub channel_id: u16,
    /// Payload bytes
    pub payload: Bytes,
}

impl TunnelMessage {
    pub fn new(msg_type: MessageType, channel_id: u16, payload: Bytes) -> Self {
        Self {
            msg_type,
            channel_id,
            payload,
        }
    }

    /// Create a data frame
    pub fn data(channel_id: u16, payload: Bytes) -> Self {
        Self::new(MessageType::Data, channel_id, payload)
    }

    /// Create a connect request frame
    pub fn connect(channel_id: u16, request: &ConnectRequest) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Connect, channel_id, request.encode()?))
    }

    pub fn connect_ok(channel_id: u16) -> Self {
        Self::new(MessageType::ConnectOk, channel_id, Bytes::new())
    }

    /// Create a connect failure frame; the reason is cut to a safe length
    pub fn connect_fail(channel_id: u16, reason: &str) -> Self {
        let mut end = reason.len().min(MAX_REASON_LEN);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        Self::new(
            MessageType::ConnectFail,
            channel_id,
            Bytes::copy_from_slice(reason[..end].as_bytes()),
        )
    }

    pub fn close(channel_id: u16) -> Self {
        Self::new(MessageType::Close, channel_id, Bytes::new())
    }

    pub fn keepalive() -> Self {
        Self::new(MessageType::Keepalive, crate::protocol::CONTROL_CHANNEL, Bytes::new())
    }

    pub fn keepalive_ack() -> Self {
        Self::new(MessageType::KeepaliveAck, crate::protocol::CONTROL_CHANNEL, Bytes::new())
    }

    /// Payload interpreted as a CONNECT_FAIL reason
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge(payload_len));
        }

        buf.reserve(FRAME_HEADER_SIZE + payload_len);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.msg_type as u8);
        buf.put_u16(self.channel_id);
        buf.put_u16(payload_len as u16);
        buf.extend_from_slice(&self.payload);

        Ok(())
    }

    /// Decode one frame from the front of `buf` using the default limits
    ///
    /// Returns the frame and the number of bytes it occupied, or `None`
    /// when more bytes are needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        FrameCodec::default().decode(buf)
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Stateless frame decoder with a configurable aggregate buffer limit
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_buffer: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_buffer: MAX_BUFFER_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self { max_buffer }
    }

    pub fn max_buffer(&self) -> usize {
        self.max_buffer
    }

    /// Decode one frame from the front of `buf` without consuming it
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(TunnelMessage, usize)>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let msg_type = MessageType::try_from(buf[1])?;
        let channel_id = u16::from_be_bytes([buf[2], buf[3]]);
        let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;

        let total_len = FRAME_HEADER_SIZE + payload_len;
        if total_len > self.max_buffer {
            return Err(ProtocolError::MessageTooLarge(total_len));
        }

        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..total_len]);

        Ok(Some((
            TunnelMessage {
                msg_type,
                channel_id,
                payload,
            },
            total_len,
        )))
    }

    /// Decode and consume one frame from an accumulating read buffer
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<TunnelMessage>, ProtocolError> {
        if buf.len() > self.max_buffer {
            return Err(ProtocolError::BufferOverflow(buf.len()));
        }

        match self.decode(buf)? {
            Some((msg, consumed)) => {
                buf.advance(consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

/// Destination carried by a CONNECT frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let host = self.host.as_bytes();
        if host.is_empty() || host.len() > MAX_HOST_LEN {
            return Err(ProtocolError::MalformedPayload(format!(
                "host length {} outside 1..={}",
                host.len(),
                MAX_HOST_LEN
            )));
        }
        if self.port == 0 {
            return Err(ProtocolError::MalformedPayload("port 0".to_string()));
        }

        let mut buf = BytesMut::with_capacity(1 + host.len() + 2);
        buf.put_u8(host.len() as u8);
        buf.extend_from_slice(host);
        buf.put_u16(self.port);
        Ok(buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (&host_len, rest) = payload
            .split_first()
            .ok_or_else(|| ProtocolError::MalformedPayload("empty CONNECT payload".to_string()))?;
        let host_len = host_len as usize;

        if host_len == 0 || host_len > MAX_HOST_LEN {
            return Err(ProtocolError::MalformedPayload(format!(
                "host length {} outside 1..={}",
                host_len, MAX_HOST_LEN
            )));
        }
        if rest.len() != host_len + 2 {
            return Err(ProtocolError::MalformedPayload(format!(
                "CONNECT payload is {} bytes, expected {}",
                payload.len(),
                host_len + 3
            )));
        }

        let host = std::str::from_utf8(&rest[..host_len])
            .map_err(|_| ProtocolError::MalformedPayload("host is not UTF-8".to_string()))?;
        let port = u16::from_be_bytes([rest[host_len], rest[host_len + 1]]);
        if port == 0 {
            return Err(ProtocolError::MalformedPayload("port 0".to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<TunnelMessage> {
        vec![
            TunnelMessage::data(7, Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n")),
            TunnelMessage::connect(1, &ConnectRequest::new("example.com", 443)).unwrap(),
            TunnelMessage::connect_ok(1),
            TunnelMessage::connect_fail(2, "connection refused"),
            TunnelMessage::close(65535),
            TunnelMessage::keepalive(),
            TunnelMessage::keepalive_ack(),
            TunnelMessage::data(3, Bytes::new()),
        ]
    }

    #[test]
    fn test_frame_encode_decode() {
        for original in sample_messages() {
            let encoded = original.encode().unwrap();
            let (decoded, consumed) = TunnelMessage::decode(&encoded).unwrap().unwrap();

            assert_eq!(decoded, original);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_header_layout() {
        let encoded = TunnelMessage::data(0x0102, Bytes::from_static(b"abc"))
            .encode()
            .unwrap();

        assert_eq!(&encoded[..], &[1, 0x01, 0x01, 0x02, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_partial_reads_at_every_offset() {
        let m1 = TunnelMessage::connect(9, &ConnectRequest::new("example.org", 8080)).unwrap();
        let m2 = TunnelMessage::data(9, Bytes::from(vec![0xAB; 300]));

        let mut wire = m1.encode().unwrap();
        wire.extend_from_slice(&m2.encode().unwrap());
        let codec = FrameCodec::default();

        for split in 0..=wire.len() {
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();

            for chunk in [&wire[..split], &wire[split..]] {
                buf.extend_from_slice(chunk);
                while let Some(msg) = codec.decode_from(&mut buf).unwrap() {
                    decoded.push(msg);
                }
            }

            assert_eq!(decoded, vec![m1.clone(), m2.clone()], "split at {}", split);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_need_more_data() {
        let encoded = TunnelMessage::data(1, Bytes::from_static(b"hello"))
            .encode()
            .unwrap();

        assert!(TunnelMessage::decode(&encoded[..3]).unwrap().is_none());
        assert!(TunnelMessage::decode(&encoded[..encoded.len() - 1])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let msg = TunnelMessage::data(1, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]));
        assert!(matches!(
            msg.encode(),
            Err(ProtocolError::MessageTooLarge(n)) if n == MAX_PAYLOAD_SIZE + 1
        ));

        let max = TunnelMessage::data(1, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE]));
        assert!(max.encode().is_ok());
    }

    #[test]
    fn test_decode_rejects_length_over_buffer_limit() {
        let codec = FrameCodec::with_max_buffer(100);
        let header = [PROTOCOL_VERSION, MessageType::Data as u8, 0, 1, 0, 200];

        assert!(matches!(
            codec.decode(&header),
            Err(ProtocolError::MessageTooLarge(206))
        ));
    }

    #[test]
    fn test_decode_rejects_overflowing_buffer() {
        let codec = FrameCodec::with_max_buffer(16);
        let mut buf = BytesMut::from(&[0u8; 17][..]);

        assert!(matches!(
            codec.decode_from(&mut buf),
            Err(ProtocolError::BufferOverflow(17))
        ));
    }

    #[test]
    fn test_decode_rejects_version_mismatch() {
        let mut encoded = TunnelMessage::close(4).encode().unwrap();
        encoded[0] = 2;

        assert!(matches!(
            TunnelMessage::decode(&encoded),
            Err(ProtocolError::VersionMismatch {
                expected: 1,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let frame = [PROTOCOL_VERSION, 0x42, 0, 1, 0, 0];
        assert!(matches!(
            TunnelMessage::decode(&frame),
            Err(ProtocolError::InvalidMessageType(0x42))
        ));
    }

    #[test]
    fn test_connect_request_bounds() {
        assert!(ConnectRequest::new("", 80).encode().is_err());
        assert!(ConnectRequest::new("a".repeat(254), 80).encode().is_err());
        assert!(ConnectRequest::new("a".repeat(253), 80).encode().is_ok());
        assert!(ConnectRequest::new("example.com", 0).encode().is_err());

        let payload = ConnectRequest::new("example.com", 80).encode().unwrap();
        let parsed = ConnectRequest::parse(&payload).unwrap();
        assert_eq!(parsed, ConnectRequest::new("example.com", 80));

        // Truncated and trailing-garbage payloads
        assert!(ConnectRequest::parse(&payload[..payload.len() - 1]).is_err());
        let mut longer = payload.to_vec();
        longer.push(0);
        assert!(ConnectRequest::parse(&longer).is_err());
        assert!(ConnectRequest::parse(&[0, 0, 80]).is_err());
        assert!(ConnectRequest::parse(&[1, b'a', 0, 0]).is_err());
    }

    #[test]
    fn test_connect_fail_reason_is_bounded() {
        let long = "é".repeat(MAX_REASON_LEN);
        let msg = TunnelMessage::connect_fail(1, &long);

        assert!(msg.payload.len() <= MAX_REASON_LEN);
        assert!(msg.reason().chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_display_brackets_ipv6() {
        assert_eq!(ConnectRequest::new("::1", 22).to_string(), "[::1]:22");
        assert_eq!(ConnectRequest::new("example.com", 80).to_string(), "example.com:80");
    }
}
