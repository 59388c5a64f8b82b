/**
 * nat_traversal/handshake.rs
 *
 * Token exchange proving a transport-level connection reached a
 * protocol-aware peer
 */

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::{Result, TraversalError};

/// Fixed token both ends exchange before any application data
pub const HANDSHAKE_TOKEN: &[u8] = b"FOXHOLE_HANDSHAKE_v1";

/// Reply deadline
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write the token, then read the peer's token back and compare.
///
/// Both ends run the same write-then-read sequence, so the exchange is
/// order-independent. A connection that actually landed on a middlebox,
/// a stale mapping or an unrelated service fails here instead of being
/// reported as established. On failure the caller drops the stream.
pub async fn verify(stream: &mut TcpStream) -> Result<()> {
    verify_with_deadline(stream, HANDSHAKE_TIMEOUT).await
}

async fn verify_with_deadline(stream: &mut TcpStream, deadline: Duration) -> Result<()> {
    stream.write_all(HANDSHAKE_TOKEN).await.map_err(|e| {
        TraversalError::NetworkUnavailable(format!("Failed to send handshake: {}", e))
    })?;

    let mut reply = [0u8; HANDSHAKE_TOKEN.len()];
    timeout(deadline, stream.read_exact(&mut reply))
        .await
        .map_err(|_| TraversalError::Timeout(format!("No handshake reply within {:?}", deadline)))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                TraversalError::ProtocolViolation("Handshake reply cut short".into())
            }
            _ => TraversalError::NetworkUnavailable(format!(
                "Failed to receive handshake reply: {}",
                e
            )),
        })?;

    if reply != HANDSHAKE_TOKEN {
        return Err(TraversalError::ProtocolViolation(
            "Handshake reply does not match the expected token".into(),
        ));
    }

    Ok(())
}
