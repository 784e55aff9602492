//! Stream framing for signaling connections: length-prefixed frames over TCP, with deadlines.

use std::time::Duration;

use mesh_core::wire::{encode_frame, payload_len, LEN_SIZE};
use mesh_core::{Contact, FrameDecodeError, FrameEncodeError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    /// Probe replies and idle connections that have not been handed off.
    pub read: Duration,
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(3),
            read: Duration::from_secs(10),
            write: Duration::from_secs(3),
        }
    }
}

/// Read one frame. `Ok(None)` when the peer closed the stream before any header byte.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut header = [0u8; LEN_SIZE];
    let mut filled = 0;
    while filled < LEN_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(TransportError::Truncated)
            };
        }
        filled += n;
    }
    let len = payload_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::Truncated
        } else {
            TransportError::Io(e)
        }
    })?;
    Ok(Some(payload))
}

pub async fn read_frame_within<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: Duration,
) -> Result<Option<Vec<u8>>, TransportError> {
    tokio::time::timeout(limit, read_frame(reader))
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Write `payload` as one frame and flush, all within `limit`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    limit: Duration,
) -> Result<(), TransportError> {
    let frame = encode_frame(payload)?;
    tokio::time::timeout(limit, async {
        writer.write_all(&frame).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| TransportError::Timeout)??;
    Ok(())
}

/// Connect to the first reachable candidate address of `contact`.
pub async fn connect_contact(
    contact: &Contact,
    signaling_port: u16,
    limit: Duration,
) -> Result<TcpStream, TransportError> {
    for candidate in contact.connect_candidates(signaling_port) {
        match tokio::time::timeout(limit, TcpStream::connect(candidate.as_str())).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => debug!(peer = %contact.public_key(), addr = %candidate, error = %e, "connect failed"),
            Err(_) => debug!(peer = %contact.public_key(), addr = %candidate, "connect timed out"),
        }
    }
    Err(TransportError::Unreachable)
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("cannot frame payload: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("timed out")]
    Timeout,
    #[error("no reachable address")]
    Unreachable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::wire::MAX_FRAME_LEN;
    use mesh_core::Keypair;

    const LIMIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn frames_in_order() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"first", LIMIT).await.unwrap();
            write_frame(&mut a, b"", LIMIT).await.unwrap();
            write_frame(&mut a, &[7u8; 300], LIMIT).await.unwrap();
        });
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), vec![7u8; 300]);
        writer.await.unwrap();
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_header_and_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[5, 0]).await.unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::Truncated)
        ));

        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[5, 0, 0, 0, b'a', b'b']).await.unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::Truncated)
        ));
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::Frame(FrameDecodeError::TooLarge))
        ));
    }

    #[tokio::test]
    async fn read_deadline() {
        let (_a, mut b) = tokio::io::duplex(64);
        let err = read_frame_within(&mut b, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn unreachable_contact() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let contact = Contact::new(
            "gone",
            *Keypair::generate().public_key(),
            vec!["127.0.0.1".into()],
        );
        let err = connect_contact(&contact, port, LIMIT).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable));
    }

    #[tokio::test]
    async fn connect_uses_first_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let contact = Contact::new(
            "here",
            *Keypair::generate().public_key(),
            vec!["".into(), addr.to_string()],
        );
        let stream = connect_contact(&contact, 1, LIMIT).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }
}
