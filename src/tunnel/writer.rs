//! Single writer per tunnel connection
//!
//! Every task that wants to put a frame on the wire goes through a
//! [`FrameSender`]; one [`FrameWriter`] task owns the write half, so frames
//! are never interleaved.

use super::{MessageType, TunnelError, TunnelMessage};
use crate::crypto::PayloadCipher;
use crate::obfuscation::{PaddingConfig, TrafficShaper};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::Activity;

/// Frames queued per tunnel connection
pub const FRAME_QUEUE_DEPTH: usize = 1024;

/// Stop coalescing queued frames into one write past this size
const COALESCE_LIMIT: usize = 256 * 1024;

/// Handle for queueing frames onto a tunnel connection
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<TunnelMessage>,
}

impl FrameSender {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<TunnelMessage>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    /// Queue a frame, waiting for room
    pub async fn send(&self, msg: TunnelMessage) -> Result<(), TunnelError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    /// Queue a frame from a context that must not wait
    pub fn send_detached(&self, msg: TunnelMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(msg).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owns the tunnel's write half
pub struct FrameWriter<W> {
    writer: W,
    rx: mpsc::Receiver<TunnelMessage>,
    cipher: Option<PayloadCipher>,
    shaper: Option<TrafficShaper>,
    padding: Option<PaddingConfig>,
    activity: Arc<Activity>,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, rx: mpsc::Receiver<TunnelMessage>, activity: Arc<Activity>) -> Self {
        Self {
            writer,
            rx,
            cipher: None,
            shaper: None,
            padding: None,
            activity,
        }
    }

    /// Seal DATA payloads before they are written
    pub fn with_cipher(mut self, cipher: Option<PayloadCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Delay each write batch
    pub fn with_shaper(mut self, shaper: Option<TrafficShaper>) -> Self {
        self.shaper = shaper;
        self
    }

    /// Pad DATA payloads to standard sizes, ahead of sealing
    pub fn with_padding(mut self, padding: Option<PaddingConfig>) -> Self {
        self.padding = padding;
        self
    }

    /// Write frames until every sender is gone or the socket fails
    pub async fn run(mut self) -> Result<(), TunnelError> {
        let mut buf = BytesMut::with_capacity(64 * 1024);

        while let Some(msg) = self.rx.recv().await {
            if let Some(shaper) = &self.shaper {
                shaper.delay().await;
            }

            self.encode(msg, &mut buf)?;
            while buf.len() < COALESCE_LIMIT {
                match self.rx.try_recv() {
                    Ok(msg) => self.encode(msg, &mut buf)?,
                    Err(_) => break,
                }
            }

            trace!(bytes = buf.len(), "Tunnel write");
            self.writer.write_all(&buf).await?;
            self.writer.flush().await?;
            self.activity.touch();
            buf.clear();
        }

        if let Err(e) = self.writer.shutdown().await {
            warn!("Tunnel shutdown failed: {}", e);
        }
        Ok(())
    }

    fn encode(&mut self, mut msg: TunnelMessage, buf: &mut BytesMut) -> Result<(), TunnelError> {
        if msg.msg_type == MessageType::Data {
            if let Some(padding) = &self.padding {
                msg.payload = padding.pad(&msg.payload)?;
            }
            if let Some(cipher) = self.cipher.as_mut() {
                msg.payload = Bytes::from(cipher.seal(&msg.payload)?);
            }
        }
        msg.encode_into(buf)?;
        Ok(())
    }
}
