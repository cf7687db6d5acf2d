//! Frame channel: one WebSocket-capable connection, inbound or outbound.
//!
//! A [`FrameChannel`] owns a reader task and a writer task over a
//! [`Transport`]. The writer drains an unbounded queue; every data byte
//! accepted by [`FrameChannel::send`] stays counted in
//! [`FrameChannel::buffered_bytes`] until the transport has flushed it.
//! The reader can be paused, which stops polling the transport so the
//! peer's TCP window fills up instead of our memory.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `frame` | `Payload`, `Frame`, `CloseInfo` and wire conversions |
//! | `transport` | Adapters from axum / tungstenite sockets, TCP tuning |
//! | `memory` | In-process transport used to drive sessions in tests |

pub mod frame;
#[cfg(test)]
pub mod memory;
pub mod transport;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub use frame::{CloseInfo, Frame, Payload};
pub use transport::Transport;

use crate::close;
use crate::errors::ChannelError;

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ChannelError> + Send>>;
/// Inbound half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ChannelError>> + Send>>;

/// Which end of a session a channel faces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// The inbound browser/game client.
    Client,
    /// The fixed upstream server.
    Upstream,
}

impl Side {
    /// Lowercase tag for logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Upstream => "upstream",
        }
    }

    /// The other side of the pair.
    pub fn opposite(self) -> Self {
        match self {
            Self::Client => Self::Upstream,
            Self::Upstream => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an established channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Frames may be sent.
    Open,
    /// A close frame was sent or received.
    Closing,
    /// The transport is gone.
    Closed,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Closing => 1,
            Self::Closed => 2,
        }
    }
}

/// Events a channel reports to its session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A complete data message arrived.
    Message(Payload),
    /// A pong arrived.
    Pong,
    /// The peer closed. A close frame without status reports 1005, a
    /// transport that ended without any close frame reports 1006.
    Closed(CloseInfo),
    /// The transport failed.
    Error(ChannelError),
}

enum Outbound {
    Frame(Frame, usize),
    Close(CloseInfo),
}

struct Shared {
    state: AtomicU8,
    buffered: AtomicUsize,
    close_requested: AtomicBool,
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Open → Closing; never moves backwards from Closed.
    fn begin_closing(&self) {
        let _ = self.state.compare_exchange(
            ChannelState::Open.as_u8(),
            ChannelState::Closing.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn release(&self, bytes: usize) {
        let _ = self.buffered.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Handle to one established WebSocket connection.
///
/// Dropping the handle terminates the channel.
pub struct FrameChannel {
    side: Side,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    reads_paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl FrameChannel {
    /// Start the reader and writer tasks over `transport`.
    ///
    /// The channel is OPEN on return. Events arrive on the returned receiver
    /// in the order the reader observed them.
    pub fn spawn(side: Side, transport: Transport) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let Transport { sink, stream } = transport;
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ChannelState::Open.as_u8()),
            buffered: AtomicUsize::new(0),
            close_requested: AtomicBool::new(false),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (paused_tx, paused_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        drop(tokio::spawn(read_loop(
            side,
            stream,
            events_tx.clone(),
            paused_rx,
            Arc::clone(&shared),
            cancel.clone(),
        )));
        drop(tokio::spawn(write_loop(
            side,
            sink,
            outbound_rx,
            events_tx,
            Arc::clone(&shared),
            cancel.clone(),
        )));

        let channel = Self {
            side,
            shared,
            outbound: outbound_tx,
            reads_paused: paused_tx,
            cancel,
        };
        (channel, events_rx)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Whether `send` will currently accept frames.
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Queue a data message. Fails with [`ChannelError::NotOpen`] unless OPEN.
    pub fn send(&self, payload: Payload) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        let size = payload.len();
        let _ = self.shared.buffered.fetch_add(size, Ordering::AcqRel);
        if self.outbound.send(Outbound::Frame(Frame::Data(payload), size)).is_err() {
            self.shared.release(size);
            return Err(ChannelError::NotOpen);
        }
        Ok(())
    }

    /// Queue a protocol-level ping.
    pub fn ping(&self) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.outbound
            .send(Outbound::Frame(Frame::Ping(Bytes::new()), 0))
            .map_err(|_| ChannelError::NotOpen)
    }

    /// Bytes accepted by `send` but not yet flushed to the transport.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// Stop polling the transport for inbound frames.
    pub fn pause_reads(&self) {
        let _ = self.reads_paused.send_replace(true);
    }

    /// Resume polling the transport.
    pub fn resume_reads(&self) {
        let _ = self.reads_paused.send_replace(false);
    }

    /// Whether reads are currently paused.
    pub fn reads_paused(&self) -> bool {
        *self.reads_paused.borrow()
    }

    /// Start the closing handshake. Only the first call has any effect.
    pub fn close(&self, info: CloseInfo) {
        if self.shared.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.state() == ChannelState::Closed {
            return;
        }
        self.shared.begin_closing();
        let _ = self.outbound.send(Outbound::Close(info));
    }

    /// Release the transport immediately. Safe to call repeatedly.
    pub fn terminate(&self) {
        self.shared.set_state(ChannelState::Closed);
        self.cancel.cancel();
    }
}

impl Drop for FrameChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for FrameChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameChannel")
            .field("side", &self.side)
            .field("state", &self.state())
            .field("buffered", &self.buffered_bytes())
            .field("reads_paused", &self.reads_paused())
            .finish_non_exhaustive()
    }
}

async fn read_loop(
    side: Side,
    mut stream: FrameStream,
    events: mpsc::UnboundedSender<ChannelEvent>,
    mut paused: watch::Receiver<bool>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        if *paused.borrow_and_update() {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        let next = tokio::select! {
            () = cancel.cancelled() => return,
            changed = paused.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            next = stream.next() => next,
        };

        let event = match next {
            Some(Ok(Frame::Data(payload))) => ChannelEvent::Message(payload),
            Some(Ok(Frame::Pong(_))) => ChannelEvent::Pong,
            // Pings are answered by the websocket layer itself.
            Some(Ok(Frame::Ping(_))) => continue,
            Some(Ok(Frame::Close(info))) => {
                trace!(%side, ?info, "peer sent close");
                shared.begin_closing();
                let info = info.unwrap_or_else(|| CloseInfo::new(close::NO_STATUS, ""));
                let _ = events.send(ChannelEvent::Closed(info));
                return;
            }
            Some(Err(err)) => {
                shared.set_state(ChannelState::Closed);
                let _ = events.send(ChannelEvent::Error(err));
                return;
            }
            None => {
                shared.set_state(ChannelState::Closed);
                let _ = events.send(ChannelEvent::Closed(CloseInfo::new(close::ABNORMAL, "")));
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

async fn write_loop(
    side: Side,
    mut sink: FrameSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    while let Some(item) = tokio::select! {
        () = cancel.cancelled() => None,
        item = outbound.recv() => item,
    } {
        match item {
            Outbound::Frame(frame, size) => {
                let result = tokio::select! {
                    () = cancel.cancelled() => return,
                    result = sink.send(frame) => result,
                };
                shared.release(size);
                if let Err(err) = result {
                    shared.set_state(ChannelState::Closed);
                    let _ = events.send(ChannelEvent::Error(err));
                    return;
                }
            }
            Outbound::Close(info) => {
                let result = tokio::select! {
                    () = cancel.cancelled() => return,
                    result = async {
                        sink.send(Frame::Close(Some(info))).await?;
                        sink.close().await
                    } => result,
                };
                if let Err(err) = result {
                    trace!(%side, error = %err, "close handshake write failed");
                }
                return;
            }
        }
    }
}
