//! Transport abstraction
//!
//! A transport is any bidirectional, message-oriented channel expressed as a
//! `futures` [`Stream`] of inbound [`Frame`]s plus a [`Sink`] for outbound
//! ones. The WebSocket adapter lives in the server crate; [`memory`] provides
//! an in-process pair.

use futures::{Sink, Stream};

/// One framed message on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    /// Bytes of a data-carrying frame; `None` for control frames.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Frame::Text(text) => Some(text.as_bytes()),
            Frame::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Marker trait for anything a [`Connection`](crate::Connection) can drive.
pub trait Transport<E>:
    Stream<Item = Result<Frame, E>> + Sink<Frame, Error = E> + Send + Unpin + 'static
{
}

impl<T, E> Transport<E> for T where
    T: Stream<Item = Result<Frame, E>> + Sink<Frame, Error = E> + Send + Unpin + 'static
{
}

pub mod memory {
    //! In-process transport pair.
    //!
    //! [`MemoryTransport`] is handed to the hub; [`MemoryPeer`] plays the
    //! client. Outbound frames go through a bounded buffer, so a peer that
    //! never reads eventually stalls the connection's writer. Dropping the
    //! peer's reader makes writes fail; dropping its writer ends the stream.

    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures::channel::mpsc;
    use futures::{Sink, SinkExt, Stream, StreamExt};
    use serde_json::Value;

    use super::Frame;
    use crate::message::OutboundMessage;

    #[derive(Debug, Clone, thiserror::Error)]
    #[error("{0}")]
    pub struct MemoryTransportError(pub String);

    /// Create a connected pair with `capacity` frames of outbound buffering.
    pub fn pair(capacity: usize) -> (MemoryTransport, MemoryPeer) {
        let (to_hub, incoming) = mpsc::unbounded();
        let (outgoing, from_hub) = mpsc::channel(capacity);
        (
            MemoryTransport { incoming, outgoing },
            MemoryPeer {
                writer: Some(to_hub),
                reader: Some(from_hub),
            },
        )
    }

    pub struct MemoryTransport {
        incoming: mpsc::UnboundedReceiver<Result<Frame, MemoryTransportError>>,
        outgoing: mpsc::Sender<Frame>,
    }

    impl Stream for MemoryTransport {
        type Item = Result<Frame, MemoryTransportError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.incoming.poll_next_unpin(cx)
        }
    }

    impl Sink<Frame> for MemoryTransport {
        type Error = MemoryTransportError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.outgoing.poll_ready_unpin(cx).map_err(disconnected)
        }

        fn start_send(mut self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
            self.outgoing.start_send_unpin(frame).map_err(disconnected)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.outgoing.poll_flush_unpin(cx).map_err(disconnected)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.outgoing.poll_close_unpin(cx).map_err(disconnected)
        }
    }

    fn disconnected(err: mpsc::SendError) -> MemoryTransportError {
        MemoryTransportError(err.to_string())
    }

    /// Client side of a [`pair`].
    pub struct MemoryPeer {
        writer: Option<mpsc::UnboundedSender<Result<Frame, MemoryTransportError>>>,
        reader: Option<mpsc::Receiver<Frame>>,
    }

    impl MemoryPeer {
        /// Deliver a frame to the hub. Returns false once the hub side is gone.
        pub fn send_frame(&self, frame: Frame) -> bool {
            self.push(Ok(frame))
        }

        pub fn send_text(&self, text: impl Into<String>) -> bool {
            self.send_frame(Frame::Text(text.into()))
        }

        pub fn send_json(&self, value: &Value) -> bool {
            self.send_text(value.to_string())
        }

        /// Make the hub's next read fail with `reason`.
        pub fn inject_read_error(&self, reason: impl Into<String>) -> bool {
            self.push(Err(MemoryTransportError(reason.into())))
        }

        /// End the inbound stream, as if the client hung up.
        pub fn hang_up(&mut self) {
            self.writer = None;
        }

        /// Stop reading; the hub's subsequent writes fail.
        pub fn drop_reader(&mut self) {
            self.reader = None;
        }

        /// Next frame written by the hub, or `None` once its writer is closed.
        pub async fn next_frame(&mut self) -> Option<Frame> {
            match self.reader.as_mut() {
                Some(reader) => reader.next().await,
                None => None,
            }
        }

        /// Next decoded outbound message, skipping control frames.
        pub async fn next_message(&mut self) -> Option<OutboundMessage> {
            loop {
                match self.next_frame().await? {
                    Frame::Text(text) => return serde_json::from_str(&text).ok(),
                    Frame::Binary(bytes) => return serde_json::from_slice(&bytes).ok(),
                    Frame::Close => return None,
                    Frame::Ping(_) | Frame::Pong(_) => continue,
                }
            }
        }

        /// Next decoded outbound message that is not a heartbeat.
        pub async fn next_application_message(&mut self) -> Option<OutboundMessage> {
            loop {
                let msg = self.next_message().await?;
                if !msg.is_ping() {
                    return Some(msg);
                }
            }
        }

        fn push(&self, item: Result<Frame, MemoryTransportError>) -> bool {
            match &self.writer {
                Some(writer) => writer.unbounded_send(item).is_ok(),
                None => false,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn frames_flow_both_ways() {
            let (mut transport, mut peer) = pair(4);

            assert!(peer.send_text("hello"));
            assert_eq!(
                transport.next().await.unwrap().unwrap(),
                Frame::Text("hello".into())
            );

            transport.send(Frame::Text("world".into())).await.unwrap();
            assert_eq!(peer.next_frame().await, Some(Frame::Text("world".into())));
        }

        #[tokio::test]
        async fn dropped_reader_fails_writes() {
            let (mut transport, mut peer) = pair(4);
            peer.drop_reader();
            assert!(transport.send(Frame::Text("x".into())).await.is_err());
        }

        #[tokio::test]
        async fn hang_up_ends_stream() {
            let (mut transport, mut peer) = pair(4);
            peer.hang_up();
            assert!(transport.next().await.is_none());
            assert!(!peer.send_text("late"));
        }
    }
}
