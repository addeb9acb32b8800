use std::io;
use std::pin::Pin;

use async_stream::stream;
use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ByteOrder;
use crate::error::{RouterError, TransportError};
use crate::message::Message;

/// A stream of raw frame payloads read from the engine transport.
///
/// Each frame is a 4-byte length prefix followed by that many payload bytes.
/// The stream ends when the peer closes the connection between frames and
/// yields a final error for any other transport fault.
pub struct FrameInbound {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>,
}

impl FrameInbound {
    pub fn new<R>(reader: R, byte_order: ByteOrder, max_frame_len: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = stream! {
            let mut reader = reader;
            loop {
                match read_frame(&mut reader, byte_order, max_frame_len).await {
                    Ok(Some(frame)) => yield Ok(frame),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };

        Self {
            inner: Box::pin(inner),
        }
    }
}

impl Stream for FrameInbound {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

async fn read_frame<R>(
    reader: &mut R,
    byte_order: ByteOrder,
    max_frame_len: usize,
) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    // Only an EOF before the first prefix byte is a clean close.
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed after {filled} of 4 length bytes"),
                )
                .into());
            }
            n => filled += n,
        }
    }

    let len = byte_order.read_len(prefix) as usize;
    if len > max_frame_len {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload.freeze()))
}

/// The write half of the engine transport.
pub struct FrameOutbound {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    byte_order: ByteOrder,
}

impl FrameOutbound {
    pub fn new<W>(writer: W, byte_order: ByteOrder) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            writer: Box::new(writer),
            byte_order,
        }
    }

    /// Encode and send a message as one frame.
    pub async fn send(&mut self, message: &Message) -> Result<(), RouterError> {
        let payload = message.encode()?;
        self.send_raw(payload.as_bytes()).await?;
        Ok(())
    }

    /// Send raw payload bytes with a length prefix.
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_slice(&self.byte_order.write_len(len));
        buf.put_slice(payload);

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InstanceId, MessageId, kind};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_frames_cross_the_wire() {
        let (client, server) = tokio::io::duplex(1024);
        let mut outbound = FrameOutbound::new(client, ByteOrder::Big);
        let mut inbound = FrameInbound::new(server, ByteOrder::Big, 1024);

        let msg = Message::new(InstanceId::new(1), kind::GRAMMAR_SET, MessageId::new(5), "yes,no");
        outbound.send(&msg).await.unwrap();
        outbound.send_raw(b"second").await.unwrap();

        let first = inbound.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b">>1|grammarSet|5|yes,no<<");
        let second = inbound.next().await.unwrap().unwrap();
        assert_eq!(&second[..], b"second");
    }

    #[tokio::test]
    async fn test_stream_ends_on_close() {
        let (client, server) = tokio::io::duplex(64);
        let mut inbound = FrameInbound::new(server, ByteOrder::Little, 64);
        drop(client);
        assert!(inbound.next().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut inbound = FrameInbound::new(server, ByteOrder::Little, 8);

        client.write_all(&100u32.to_le_bytes()).await.unwrap();
        let result = inbound.next().await.unwrap();
        assert!(matches!(
            result,
            Err(TransportError::FrameTooLarge { len: 100, max: 8 })
        ));
        assert!(inbound.next().await.is_none());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_io_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut inbound = FrameInbound::new(server, ByteOrder::Little, 64);

        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        assert!(matches!(
            inbound.next().await.unwrap(),
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_prefix_is_io_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut inbound = FrameInbound::new(server, ByteOrder::Little, 64);

        client.write_all(&[7, 0]).await.unwrap();
        drop(client);

        match inbound.next().await.unwrap() {
            Err(TransportError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected an I/O error, got {other:?}"),
        }
        assert!(inbound.next().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_fields_never_reach_the_wire() {
        let (client, server) = tokio::io::duplex(64);
        let mut outbound = FrameOutbound::new(client, ByteOrder::Little);
        let mut inbound = FrameInbound::new(server, ByteOrder::Little, 64);

        let bad = Message::new(InstanceId::new(1), kind::PLAY, MessageId::new(1), "a|b");
        assert!(matches!(
            outbound.send(&bad).await,
            Err(RouterError::FieldEncoding(_))
        ));
        drop(outbound);
        assert!(inbound.next().await.is_none());
    }
}
