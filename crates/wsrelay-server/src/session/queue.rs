//! Pre-open queue: client messages held while the upstream handshake runs.

use std::collections::VecDeque;

use crate::channel::{FrameChannel, Payload};
use crate::errors::ChannelError;

/// Anything the queue can flush into.
pub trait MessageSink {
    /// Whether `send` would currently accept a message.
    fn is_open(&self) -> bool;
    /// Send one message.
    fn send(&self, payload: Payload) -> Result<(), ChannelError>;
}

impl MessageSink for FrameChannel {
    fn is_open(&self) -> bool {
        FrameChannel::is_open(self)
    }

    fn send(&self, payload: Payload) -> Result<(), ChannelError> {
        FrameChannel::send(self, payload)
    }
}

/// The queue grew past its byte ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("pre-open queue holds {queued_bytes} bytes, ceiling is {max_bytes}")]
pub struct QueueOverflow {
    /// Bytes queued including the message that overflowed.
    pub queued_bytes: usize,
    /// Configured ceiling.
    pub max_bytes: usize,
}

/// Result of a flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Messages handed to the sink.
    pub sent: usize,
    /// Payload bytes handed to the sink.
    pub sent_bytes: usize,
    /// Messages dropped because the sink left OPEN mid-flush.
    pub discarded: usize,
}

/// Bounded FIFO of client payloads awaiting an open upstream.
#[derive(Debug)]
pub struct PreOpenQueue {
    entries: VecDeque<Payload>,
    bytes: usize,
    max_bytes: usize,
}

impl PreOpenQueue {
    /// Empty queue with the given byte ceiling.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    /// Append a payload. Exceeding the ceiling is an error the caller must
    /// turn into a session abort; the queue keeps what it already holds.
    pub fn enqueue(&mut self, payload: Payload) -> Result<(), QueueOverflow> {
        self.bytes += payload.len();
        self.entries.push_back(payload);
        if self.bytes > self.max_bytes {
            return Err(QueueOverflow {
                queued_bytes: self.bytes,
                max_bytes: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Send every entry in insertion order. Stops at the first entry the
    /// sink refuses; the rest are discarded. The queue is empty afterwards.
    pub fn flush(&mut self, sink: &impl MessageSink) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        while let Some(payload) = self.entries.pop_front() {
            let size = payload.len();
            if !sink.is_open() || sink.send(payload).is_err() {
                outcome.discarded = self.entries.len() + 1;
                break;
            }
            outcome.sent += 1;
            outcome.sent_bytes += size;
        }
        self.clear();
        outcome
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    /// Queued payload bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
