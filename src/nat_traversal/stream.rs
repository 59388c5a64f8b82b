/**
 * nat_traversal/stream.rs
 *
 * Datagram-to-stream adapter and the unified connection handle
 */

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::error::{Result, TraversalError};

/// One UDP socket fixed to one peer address behind a stream-style
/// read/write/close contract.
///
/// Datagram semantics pass through unchanged: no framing, no ordering
/// and no delivery guarantee beyond what the hole punch itself observed.
/// A single lock serializes every operation on the socket, so a close
/// waits for any in-flight read or write to finish.
#[derive(Debug)]
pub struct UdpStream {
    socket: Mutex<Option<UdpSocket>>,
    peer: SocketAddr,
}

impl UdpStream {
    /// Wrap a bound socket, fixing all writes to `peer`
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            socket: Mutex::new(Some(socket)),
            peer,
        }
    }

    /// Receive one datagram into `buf`
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let guard = self.socket.lock().await;
        let socket = guard.as_ref().ok_or_else(closed)?;
        let (len, _) = socket.recv_from(buf).await.map_err(|e| {
            TraversalError::NetworkUnavailable(format!("Failed to receive datagram: {}", e))
        })?;
        Ok(len)
    }

    /// Receive one datagram, failing once `deadline` passes
    pub async fn read_timeout(&self, buf: &mut [u8], deadline: Duration) -> Result<usize> {
        timeout(deadline, self.read(buf))
            .await
            .map_err(|_| TraversalError::Timeout(format!("No datagram within {:?}", deadline)))?
    }

    /// Send `buf` as one datagram to the fixed peer address
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let guard = self.socket.lock().await;
        let socket = guard.as_ref().ok_or_else(closed)?;
        socket.send_to(buf, self.peer).await.map_err(|e| {
            TraversalError::NetworkUnavailable(format!("Failed to send datagram: {}", e))
        })?;
        Ok(())
    }

    /// Release the socket. Safe to call more than once; later calls are
    /// no-ops.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.socket.lock().await;
        guard.take();
        Ok(())
    }

    /// The fixed peer address writes are directed at
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

fn closed() -> TraversalError {
    TraversalError::NetworkUnavailable("Socket already closed".into())
}

/// Established connection handle, either plain TCP or the UDP adapter.
///
/// The variant stays visible on purpose: the UDP side keeps datagram
/// semantics and is not interchangeable with an ordered byte stream.
#[derive(Debug)]
pub enum PeerConnection {
    Tcp(TcpStream),
    Udp(UdpStream),
}

impl PeerConnection {
    /// Read some bytes; one whole datagram on the UDP side
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            PeerConnection::Tcp(stream) => stream.read(buf).await.map_err(|e| {
                TraversalError::NetworkUnavailable(format!("Failed to read from stream: {}", e))
            }),
            PeerConnection::Udp(stream) => stream.read(buf).await,
        }
    }

    /// Read with a deadline
    pub async fn read_timeout(&mut self, buf: &mut [u8], deadline: Duration) -> Result<usize> {
        match self {
            PeerConnection::Tcp(stream) => timeout(deadline, stream.read(buf))
                .await
                .map_err(|_| TraversalError::Timeout(format!("No data within {:?}", deadline)))?
                .map_err(|e| {
                    TraversalError::NetworkUnavailable(format!(
                        "Failed to read from stream: {}",
                        e
                    ))
                }),
            PeerConnection::Udp(stream) => stream.read_timeout(buf, deadline).await,
        }
    }

    /// Write all of `buf`
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            PeerConnection::Tcp(stream) => stream.write_all(buf).await.map_err(|e| {
                TraversalError::NetworkUnavailable(format!("Failed to write to stream: {}", e))
            }),
            PeerConnection::Udp(stream) => stream.write_all(buf).await,
        }
    }

    /// Close the transport
    pub async fn close(&mut self) -> Result<()> {
        match self {
            PeerConnection::Tcp(stream) => stream.shutdown().await.map_err(|e| {
                TraversalError::NetworkUnavailable(format!("Failed to shut down stream: {}", e))
            }),
            PeerConnection::Udp(stream) => stream.close().await,
        }
    }

    /// Remote address of the transport
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match self {
            PeerConnection::Tcp(stream) => stream.peer_addr().map_err(|e| {
                TraversalError::NetworkUnavailable(format!("Failed to get peer address: {}", e))
            }),
            PeerConnection::Udp(stream) => Ok(stream.peer_addr()),
        }
    }
}
