//! Byte transports under the connection endpoint
//!
//! The endpoint only needs bounded reads and full writes. Both execution
//! models implement that here: [`StreamTransport`] suspends on tokio streams,
//! [`BlockingTransport`] issues blocking syscalls and is driven with
//! `futures::executor::block_on` on its own OS thread.

use async_trait::async_trait;
use bytes::BytesMut;
use log::trace;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::IpcError;

/// Chunk sizes used while accumulating a part: the largest tier that fits
/// the remaining length, otherwise the remainder itself.
pub const READ_CHUNK_TIERS: [usize; 2] = [8192, 4096];

/// Size of the next read when `remaining` bytes are still expected
pub fn chunk_len(remaining: usize) -> usize {
    READ_CHUNK_TIERS
        .iter()
        .copied()
        .find(|tier| remaining >= *tier)
        .unwrap_or(remaining)
}

/// Minimal byte stream the endpoint is written against
#[async_trait]
pub trait FrameTransport: Send {
    /// Read at most `buf.len()` bytes. Zero means the peer closed.
    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, IpcError>;

    /// Write the whole buffer or fail
    async fn write_all(&mut self, data: &[u8]) -> Result<(), IpcError>;

    async fn flush(&mut self) -> Result<(), IpcError>;

    /// Close both directions
    async fn shutdown(&mut self) -> Result<(), IpcError>;

    fn peer(&self) -> Option<SocketAddr>;

    /// Read exactly `len` bytes, looping over bounded chunks
    async fn read_exact(&mut self, len: usize) -> Result<BytesMut, IpcError> {
        let mut out = BytesMut::with_capacity(len);
        let mut chunk = vec![0u8; chunk_len(len)];
        while out.len() < len {
            let want = chunk_len(len - out.len());
            let read = self.read_some(&mut chunk[..want]).await?;
            if read == 0 {
                return Err(IpcError::ConnectionClosed);
            }
            out.extend_from_slice(&chunk[..read]);
        }
        Ok(out)
    }
}

/// Transport over any tokio stream
pub struct StreamTransport<S> {
    stream: S,
    peer: Option<SocketAddr>,
    read_timeout: Option<Duration>,
}

/// Cooperative TCP transport
pub type TokioTransport = StreamTransport<TcpStream>;

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            peer: None,
            read_timeout: None,
        }
    }

    /// Bound every read; an expired read fails with [`IpcError::Timeout`]
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl StreamTransport<TcpStream> {
    /// Connect to a coordinator
    pub async fn connect(addr: &str) -> Result<Self, IpcError> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_tcp(stream)
    }

    pub fn from_tcp(stream: TcpStream) -> Result<Self, IpcError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream,
            peer,
            read_timeout: None,
        })
    }
}

#[async_trait]
impl<S> FrameTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, IpcError> {
        let read = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.stream.read(buf))
                .await
                .map_err(|_| IpcError::Timeout)??,
            None => self.stream.read(buf).await?,
        };
        trace!("read {} bytes", read);
        Ok(read)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), IpcError> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), IpcError> {
        self.stream.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), IpcError> {
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            // Already gone on the other side
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Blocking TCP transport for the thread-per-conversation model
pub struct BlockingTransport {
    stream: std::net::TcpStream,
    peer: Option<SocketAddr>,
}

impl BlockingTransport {
    pub fn connect(addr: impl ToSocketAddrs, read_timeout: Option<Duration>) -> Result<Self, IpcError> {
        let stream = std::net::TcpStream::connect(addr)?;
        Self::from_std(stream, read_timeout)
    }

    pub fn from_std(stream: std::net::TcpStream, read_timeout: Option<Duration>) -> Result<Self, IpcError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(read_timeout)?;
        let peer = stream.peer_addr().ok();
        Ok(Self { stream, peer })
    }

    /// Handle that can wake a read blocked on this socket from another thread
    pub fn read_interrupt(&self) -> Result<ReadInterrupt, IpcError> {
        Ok(ReadInterrupt {
            stream: self.stream.try_clone()?,
        })
    }
}

/// Shuts down the read half of a [`BlockingTransport`]. The pending read
/// returns zero bytes while writes keep working, so the owner can still say
/// goodbye to the peer.
#[derive(Debug)]
pub struct ReadInterrupt {
    stream: std::net::TcpStream,
}

impl ReadInterrupt {
    pub fn interrupt(&self) -> Result<(), IpcError> {
        match self.stream.shutdown(Shutdown::Read) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl FrameTransport for BlockingTransport {
    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, IpcError> {
        loop {
            match self.stream.read(buf) {
                Ok(read) => {
                    trace!("read {} bytes", read);
                    return Ok(read);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), IpcError> {
        self.stream.write_all(data)?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), IpcError> {
        self.stream.flush()?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), IpcError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Listening socket handing out transports
#[async_trait]
pub trait FrameListener: Send {
    type Transport: FrameTransport + 'static;

    async fn accept(&mut self) -> Result<Self::Transport, IpcError>;

    fn local_addr(&self) -> Result<SocketAddr, IpcError>;

    /// Stop listening. Further accepts fail with [`IpcError::ConnectionClosed`].
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Cooperative listener
pub struct TokioListener {
    listener: Option<TcpListener>,
    read_timeout: Option<Duration>,
}

impl TokioListener {
    pub async fn bind(addr: &str, read_timeout: Option<Duration>) -> Result<Self, IpcError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener: Some(listener),
            read_timeout,
        })
    }
}

#[async_trait]
impl FrameListener for TokioListener {
    type Transport = TokioTransport;

    async fn accept(&mut self) -> Result<TokioTransport, IpcError> {
        let listener = self.listener.as_ref().ok_or(IpcError::ConnectionClosed)?;
        let (stream, addr) = listener.accept().await?;
        trace!("accepted connection from {}", addr);
        Ok(StreamTransport::from_tcp(stream)?.with_read_timeout(self.read_timeout))
    }

    fn local_addr(&self) -> Result<SocketAddr, IpcError> {
        let listener = self.listener.as_ref().ok_or(IpcError::ConnectionClosed)?;
        Ok(listener.local_addr()?)
    }

    fn close(&mut self) {
        self.listener = None;
    }

    fn is_open(&self) -> bool {
        self.listener.is_some()
    }
}

/// Blocking listener for the thread-per-conversation model
pub struct BlockingListener {
    listener: Option<std::net::TcpListener>,
    read_timeout: Option<Duration>,
}

impl BlockingListener {
    pub fn bind(addr: impl ToSocketAddrs, read_timeout: Option<Duration>) -> Result<Self, IpcError> {
        let listener = std::net::TcpListener::bind(addr)?;
        Ok(Self {
            listener: Some(listener),
            read_timeout,
        })
    }
}

#[async_trait]
impl FrameListener for BlockingListener {
    type Transport = BlockingTransport;

    async fn accept(&mut self) -> Result<BlockingTransport, IpcError> {
        let listener = self.listener.as_ref().ok_or(IpcError::ConnectionClosed)?;
        let (stream, addr) = listener.accept()?;
        trace!("accepted connection from {}", addr);
        BlockingTransport::from_std(stream, self.read_timeout)
    }

    fn local_addr(&self) -> Result<SocketAddr, IpcError> {
        let listener = self.listener.as_ref().ok_or(IpcError::ConnectionClosed)?;
        Ok(listener.local_addr()?)
    }

    fn close(&mut self) {
        self.listener = None;
    }

    fn is_open(&self) -> bool {
        self.listener.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_tiers() {
        assert_eq!(chunk_len(100_000), 8192);
        assert_eq!(chunk_len(8192), 8192);
        assert_eq!(chunk_len(8191), 4096);
        assert_eq!(chunk_len(4096), 4096);
        assert_eq!(chunk_len(4095), 4095);
        assert_eq!(chunk_len(0), 0);
    }

    #[tokio::test]
    async fn test_read_exact_accumulates_short_reads() {
        let (client, server) = tokio::io::duplex(512);
        let mut reader = StreamTransport::new(server);
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            let mut writer = StreamTransport::new(client);
            writer.write_all(&payload).await.unwrap();
            writer.flush().await.unwrap();
            writer
        });

        let received = reader.read_exact(20_000).await.unwrap();
        assert_eq!(received.as_ref(), expected.as_slice());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_exact_reports_closed_peer() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = StreamTransport::new(server);
        let mut writer = StreamTransport::new(client);
        writer.write_all(b"abc").await.unwrap();
        drop(writer);

        let err = reader.read_exact(10).await.unwrap_err();
        assert!(matches!(err, IpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader =
            StreamTransport::new(server).with_read_timeout(Some(Duration::from_millis(20)));
        let err = reader.read_exact(4).await.unwrap_err();
        assert!(matches!(err, IpcError::Timeout));
    }

    #[tokio::test]
    async fn test_tokio_listener_close() {
        let mut listener = TokioListener::bind("127.0.0.1:0", None).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TokioTransport::connect(&addr.to_string()).await });
        let accepted = listener.accept().await.unwrap();
        assert!(accepted.peer().is_some());
        connect.await.unwrap().unwrap();

        listener.close();
        assert!(!listener.is_open());
        assert!(matches!(listener.accept().await, Err(IpcError::ConnectionClosed)));
    }

    #[test]
    fn test_blocking_transport_round_trip() {
        let mut listener = BlockingListener::bind("127.0.0.1:0", None).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut transport = BlockingTransport::connect(addr, None).unwrap();
            futures::executor::block_on(async {
                transport.write_all(&[7u8; 9000]).await.unwrap();
                transport.flush().await.unwrap();
            });
            transport
        });

        let mut accepted = futures::executor::block_on(listener.accept()).unwrap();
        let received = futures::executor::block_on(accepted.read_exact(9000)).unwrap();
        assert!(received.iter().all(|b| *b == 7));
        client.join().unwrap();
    }

    #[test]
    fn test_read_interrupt_wakes_blocked_read() {
        let mut listener = BlockingListener::bind("127.0.0.1:0", None).unwrap();
        let addr = listener.local_addr().unwrap();
        let reader = std::thread::spawn(move || {
            let mut transport = BlockingTransport::connect(addr, None).unwrap();
            let interrupt = transport.read_interrupt().unwrap();
            let waker = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                interrupt.interrupt().unwrap();
            });
            let mut buf = [0u8; 4];
            let read = futures::executor::block_on(transport.read_some(&mut buf)).unwrap();
            waker.join().unwrap();
            // The write half survives the interrupt
            futures::executor::block_on(transport.write_all(b"bye")).unwrap();
            read
        });

        let mut accepted = futures::executor::block_on(listener.accept()).unwrap();
        assert_eq!(reader.join().unwrap(), 0);
        let received = futures::executor::block_on(accepted.read_exact(3)).unwrap();
        assert_eq!(received.as_ref(), b"bye");
    }
}
