//! TCP link with length-prefixed frames.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes.
//! On connect both sides exchange their address in text form as the first
//! frame; the connecting side writes first.

use crate::address::SimulatorAddress;
use crate::error::EnvError;
use crate::network::{Frame, InboxSender, Link};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A link to a neighbour over a TCP stream.
pub struct TcpLink {
    remote: SimulatorAddress,
    writer: Mutex<OwnedWriteHalf>,
    closed: Arc<AtomicBool>,
}

impl TcpLink {
    /// Connects to a listening peer and starts delivering its frames into `inbox`.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        local: SimulatorAddress,
        inbox: InboxSender,
    ) -> Result<Arc<Self>, EnvError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(&mut writer, local.to_string().as_bytes()).await?;
        let remote = read_handshake(&mut reader).await?;

        Ok(Self::start(remote, reader, writer, inbox))
    }

    /// Accepts one peer from `listener` and starts delivering its frames into `inbox`.
    pub async fn accept(
        listener: &TcpListener,
        local: SimulatorAddress,
        inbox: InboxSender,
    ) -> Result<Arc<Self>, EnvError> {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let remote = read_handshake(&mut reader).await?;
        write_frame(&mut writer, local.to_string().as_bytes()).await?;
        tracing::debug!(%remote, %peer, "accepted link");

        Ok(Self::start(remote, reader, writer, inbox))
    }

    fn start(
        remote: SimulatorAddress,
        mut reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        inbox: InboxSender,
    ) -> Arc<Self> {
        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = closed.clone();

        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if inbox.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(%remote, "peer closed link");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(%remote, error = %e, "link read failed");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::Release);
        });

        Arc::new(Self {
            remote,
            writer: Mutex::new(writer),
            closed,
        })
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn send(&self, frame: Frame) -> Result<(), EnvError> {
        if self.is_closed() {
            return Err(EnvError::closed(self.remote));
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, &frame).await {
            self.closed.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn remote(&self) -> SimulatorAddress {
        self.remote
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn read_handshake(reader: &mut OwnedReadHalf) -> Result<SimulatorAddress, EnvError> {
    let frame = read_frame(reader)
        .await?
        .ok_or_else(|| EnvError::HandshakeFailed("connection closed".to_string()))?;
    let text = String::from_utf8(frame)
        .map_err(|_| EnvError::HandshakeFailed("address is not utf-8".to_string()))?;
    text.parse()
        .map_err(|e| EnvError::HandshakeFailed(format!("{}", e)))
}

async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> Result<(), EnvError>
where
    W: AsyncWriteExt + Unpin,
{
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(EnvError::FrameTooLarge(bytes.len()));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, EnvError>
where
    R: AsyncReadExt + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(EnvError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::inbox;

    #[tokio::test]
    async fn test_tcp_handshake_and_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (agent_tx, mut agent_rx) = inbox(16);
        let (coord_tx, mut coord_rx) = inbox(16);

        let accept = tokio::spawn(async move {
            TcpLink::accept(&listener, SimulatorAddress::coordinator(), coord_tx)
                .await
                .unwrap()
        });
        let to_coordinator = TcpLink::connect(
            ("127.0.0.1", port),
            SimulatorAddress::agent(1),
            agent_tx,
        )
        .await
        .unwrap();
        let to_agent = accept.await.unwrap();

        assert_eq!(to_coordinator.remote(), SimulatorAddress::coordinator());
        assert_eq!(to_agent.remote(), SimulatorAddress::agent(1));

        to_coordinator.send(b"up".to_vec()).await.unwrap();
        to_agent.send(b"down".to_vec()).await.unwrap();

        assert_eq!(coord_rx.recv().await.unwrap(), b"up".to_vec());
        assert_eq!(agent_rx.recv().await.unwrap(), b"down".to_vec());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut sink = Vec::new();
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            write_frame(&mut sink, &big).await,
            Err(EnvError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_eof_is_none() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());

        let mut encoded: &[u8] = &[0, 0, 0, 2, 7, 8];
        assert_eq!(read_frame(&mut encoded).await.unwrap(), Some(vec![7, 8]));
    }
}
