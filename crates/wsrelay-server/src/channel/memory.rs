//! In-process transport for driving channels and sessions without sockets.
//!
//! [`transport`] returns a [`Transport`] and the [`MemoryPeer`] holding the
//! other end. The peer injects inbound frames and observes what the channel
//! wrote. The outbound pipe is bounded, so a peer that stops reading makes
//! the channel's buffered byte count grow the way a stalled socket would.

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};

use super::{CloseInfo, Frame, Payload, Transport};
use crate::errors::ChannelError;

/// Remote end of an in-memory transport.
#[derive(Debug)]
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Result<Frame, ChannelError>>,
    outbound: mpsc::Receiver<Frame>,
}

/// Create a transport whose outbound pipe holds `capacity` frames (plus one).
pub fn transport(capacity: usize) -> (Transport, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded();
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let sink = outbound_tx.sink_map_err(|e| ChannelError::Transport(e.to_string()));
    let transport = Transport::new(Box::pin(sink), Box::pin(inbound_rx));
    let peer = MemoryPeer {
        inbound: inbound_tx,
        outbound: outbound_rx,
    };
    (transport, peer)
}

impl MemoryPeer {
    /// Deliver a frame to the channel.
    pub fn send(&self, frame: Frame) {
        let _ = self.inbound.unbounded_send(Ok(frame));
    }

    /// Deliver a text message.
    pub fn send_text(&self, text: &str) {
        self.send(Frame::Data(Payload::Text(text.into())));
    }

    /// Deliver a binary message.
    pub fn send_binary(&self, data: &[u8]) {
        self.send(Frame::Data(Payload::Binary(Bytes::copy_from_slice(data))));
    }

    /// Deliver a close frame.
    pub fn close(&self, code: u16, reason: &str) {
        self.send(Frame::Close(Some(CloseInfo::new(code, reason))));
    }

    /// Make the channel's reader observe a transport error.
    pub fn fail(&self, message: &str) {
        let _ = self
            .inbound
            .unbounded_send(Err(ChannelError::Transport(message.to_owned())));
    }

    /// Next frame written by the channel; `None` once the channel closed its sink.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.next().await
    }

    /// Next data payload, skipping control frames. `None` on close or end.
    pub async fn recv_data(&mut self) -> Option<Payload> {
        loop {
            match self.recv().await? {
                Frame::Data(payload) => return Some(payload),
                Frame::Close(_) => return None,
                Frame::Ping(_) | Frame::Pong(_) => {}
            }
        }
    }

    /// Wait for the close frame the channel sent, skipping everything else.
    pub async fn recv_close(&mut self) -> Option<CloseInfo> {
        loop {
            if let Frame::Close(info) = self.recv().await? {
                return info;
            }
        }
    }

    /// A frame already written, without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }
}
