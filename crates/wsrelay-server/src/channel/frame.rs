//! Frame types shared by both sides of a session, with conversions to and
//! from the inbound (axum) and outbound (tungstenite) message types.

use axum::extract::ws::{
    CloseFrame as AxumCloseFrame, Message as AxumMessage, Utf8Bytes as AxumUtf8Bytes,
};
use bytes::Bytes;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WireCloseFrame;
use tokio_tungstenite::tungstenite::{Message as WireMessage, Utf8Bytes};

/// One application message: the payload plus its text/binary tag.
///
/// Text payloads share the socket's receive buffer; relaying a text frame
/// moves the buffer from one side to the other without copying it or
/// turning it into binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// A UTF-8 text message.
    Text(Utf8Bytes),
    /// A binary message.
    Binary(Bytes),
}

impl Payload {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

/// Close status and reason carried by a close frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseInfo {
    /// Build a close payload.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A frame as seen by a [`FrameChannel`](super::FrameChannel).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Application data.
    Data(Payload),
    /// Protocol-level ping.
    Ping(Bytes),
    /// Protocol-level pong.
    Pong(Bytes),
    /// Close frame, with optional status.
    Close(Option<CloseInfo>),
}

// axum wraps the same buffer type; both conversions re-check UTF-8 in
// place and never copy. The check cannot fail on text axum produced.
fn text_from_axum(text: AxumUtf8Bytes) -> Utf8Bytes {
    Utf8Bytes::try_from(Bytes::from(text)).unwrap_or_default()
}

fn text_into_axum(text: Utf8Bytes) -> AxumUtf8Bytes {
    AxumUtf8Bytes::try_from(Bytes::from(text)).unwrap_or_default()
}

impl From<AxumMessage> for Frame {
    fn from(message: AxumMessage) -> Self {
        match message {
            AxumMessage::Text(text) => Self::Data(Payload::Text(text_from_axum(text))),
            AxumMessage::Binary(data) => Self::Data(Payload::Binary(data)),
            AxumMessage::Ping(data) => Self::Ping(data),
            AxumMessage::Pong(data) => Self::Pong(data),
            AxumMessage::Close(frame) => Self::Close(frame.map(|f| CloseInfo {
                code: f.code,
                reason: f.reason.as_str().to_owned(),
            })),
        }
    }
}

impl From<Frame> for AxumMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Data(Payload::Text(text)) => Self::Text(text_into_axum(text)),
            Frame::Data(Payload::Binary(data)) => Self::Binary(data),
            Frame::Ping(data) => Self::Ping(data),
            Frame::Pong(data) => Self::Pong(data),
            Frame::Close(info) => Self::Close(info.map(|c| AxumCloseFrame {
                code: c.code,
                reason: c.reason.into(),
            })),
        }
    }
}

impl Frame {
    /// Convert a tungstenite message. Raw `Frame` messages only appear when
    /// writing, so they are reported as `None`.
    pub fn from_wire(message: WireMessage) -> Option<Self> {
        let frame = match message {
            WireMessage::Text(text) => Self::Data(Payload::Text(text)),
            WireMessage::Binary(data) => Self::Data(Payload::Binary(data)),
            WireMessage::Ping(data) => Self::Ping(data),
            WireMessage::Pong(data) => Self::Pong(data),
            WireMessage::Close(frame) => Self::Close(frame.map(|f| CloseInfo {
                code: f.code.into(),
                reason: f.reason.as_str().to_owned(),
            })),
            WireMessage::Frame(_) => return None,
        };
        Some(frame)
    }

    /// Convert into a tungstenite message.
    pub fn into_wire(self) -> WireMessage {
        match self {
            Self::Data(Payload::Text(text)) => WireMessage::Text(text),
            Self::Data(Payload::Binary(data)) => WireMessage::Binary(data),
            Self::Ping(data) => WireMessage::Ping(data),
            Self::Pong(data) => WireMessage::Pong(data),
            Self::Close(info) => WireMessage::Close(info.map(|c| WireCloseFrame {
                code: c.code.into(),
                reason: c.reason.into(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_len_counts_bytes() {
        assert_eq!(Payload::Text("héllo".into()).len(), 6);
        assert_eq!(Payload::Binary(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])).len(), 4);
        assert!(Payload::Text(Utf8Bytes::default()).is_empty());
    }

    #[test]
    fn text_stays_text_through_axum() {
        let frame = Frame::Data(Payload::Text("ping".into()));
        let message: AxumMessage = frame.clone().into();
        assert!(matches!(message, AxumMessage::Text(_)));
        assert_eq!(Frame::from(message), frame);
    }

    #[test]
    fn text_relay_shares_the_receive_buffer() {
        let received = WireMessage::text("héllo wörld");
        let WireMessage::Text(original) = received.clone() else {
            unreachable!()
        };
        let Some(Frame::Data(Payload::Text(relayed))) = Frame::from_wire(received) else {
            panic!("expected a text frame");
        };
        let original = Bytes::from(original);
        let relayed = Bytes::from(relayed);
        assert_eq!(relayed.as_ptr(), original.as_ptr());
    }

    #[test]
    fn text_through_axum_keeps_its_buffer() {
        let text = Utf8Bytes::from("bienvenue");
        let ptr = text.as_ptr();
        let AxumMessage::Text(outbound) = AxumMessage::from(Frame::Data(Payload::Text(text))) else {
            panic!("expected axum text");
        };
        assert_eq!(outbound.as_ptr(), ptr);
        let Frame::Data(Payload::Text(back)) = Frame::from(AxumMessage::Text(outbound)) else {
            panic!("expected a text frame");
        };
        assert_eq!(back.as_ptr(), ptr);
        assert_eq!(back, "bienvenue");
    }

    #[test]
    fn binary_stays_binary_through_wire() {
        let frame = Frame::Data(Payload::Binary(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])));
        let message = frame.clone().into_wire();
        assert!(message.is_binary());
        assert_eq!(Frame::from_wire(message), Some(frame));
    }

    #[test]
    fn close_code_preserved_through_wire() {
        let frame = Frame::Close(Some(CloseInfo::new(4001, "kicked")));
        let back = Frame::from_wire(frame.clone().into_wire());
        assert_eq!(back, Some(frame));
    }
}
