//! Adapters that turn concrete WebSocket streams into a [`Transport`].

use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt, future};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WireMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{Frame, FrameSink, FrameStream};
use crate::errors::ChannelError;

/// TCP keepalive probe delay applied to both sockets of a session.
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// The two halves a [`FrameChannel`](super::FrameChannel) drives.
pub struct Transport {
    /// Where outbound frames go.
    pub sink: FrameSink,
    /// Where inbound frames come from.
    pub stream: FrameStream,
}

impl Transport {
    /// Pair an already-boxed sink and stream.
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }

    /// Wrap an upgraded inbound socket.
    pub fn from_axum(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(ChannelError::from)
            .with(|frame: Frame| future::ready(Ok::<_, ChannelError>(AxumMessage::from(frame))));
        let stream = stream.map(|item| item.map(Frame::from).map_err(ChannelError::from));
        Self::new(Box::pin(sink), Box::pin(stream))
    }

    /// Wrap a connected outbound socket.
    pub fn from_tungstenite<S>(socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(ChannelError::from)
            .with(|frame: Frame| future::ready(Ok::<_, ChannelError>(frame.into_wire())));
        let stream = stream.filter_map(|item: Result<WireMessage, _>| {
            future::ready(match item {
                Ok(message) => Frame::from_wire(message).map(Ok),
                Err(err) => Some(Err(ChannelError::from(err))),
            })
        });
        Self::new(Box::pin(sink), Box::pin(stream))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Disable Nagle and enable keepalive probes. Failures are logged and ignored.
pub fn tune_socket(stream: &TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(error = %err, "failed to set TCP_NODELAY");
    }
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %err, "failed to enable TCP keepalive");
    }
}

/// Tune the TCP socket underneath a possibly TLS-wrapped upstream stream.
pub fn tune_upstream(stream: &MaybeTlsStream<TcpStream>) {
    match stream {
        MaybeTlsStream::Plain(tcp) => tune_socket(tcp),
        MaybeTlsStream::Rustls(tls) => tune_socket(tls.get_ref().0),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tune_socket_sets_nodelay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        let _server = accept.await.unwrap();

        tune_socket(&client);
        assert!(client.nodelay().unwrap());
        assert!(SockRef::from(&client).keepalive().unwrap());
    }
}
