/**
 * nat_traversal/types.rs
 *
 * Core types for the traversal state machine
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use super::error::{Result, TraversalError};
use super::stream::PeerConnection;

/// Which side of the rendezvous this host plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes its address first and waits for the peer
    Listener,
    /// Looks the listener up and initiates
    Connector,
}

/// Peer connection information, exchanged verbatim as JSON through the
/// signalling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub id: String,
    /// Externally visible IP
    #[serde(rename = "ip")]
    pub public_ip: IpAddr,
    /// Externally visible port
    #[serde(rename = "port")]
    pub public_port: u16,
    pub local_ip: IpAddr,
    pub local_port: u16,
}

impl PeerAddress {
    /// Endpoint the connection strategies are aimed at
    pub fn public_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.public_ip, self.public_port)
    }
}

/// Traversal configuration, validated before any network activity
#[derive(Debug, Clone)]
pub struct TraversalConfig {
    pub role: Role,
    /// Identity this host publishes under
    pub local_id: String,
    /// Identity of the peer to reach; required for the connector
    pub remote_id: Option<String>,
    /// STUN server as host:port
    pub stun_server: String,
    /// Local port to bind; the listener needs a fixed one
    pub local_port: u16,
    /// Budget for each TCP dial, in seconds
    pub timeout_secs: u64,
}

impl TraversalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.local_id.is_empty() {
            return Err(TraversalError::InvalidConfig(
                "local id must not be empty".into(),
            ));
        }
        if self.stun_server.is_empty() {
            return Err(TraversalError::InvalidConfig(
                "STUN server must not be empty".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(TraversalError::InvalidConfig(
                "timeout must be non-zero".into(),
            ));
        }
        match self.role {
            Role::Connector => {
                if self.remote_id.as_deref().unwrap_or("").is_empty() {
                    return Err(TraversalError::InvalidConfig(
                        "connector requires a remote id".into(),
                    ));
                }
            }
            Role::Listener => {
                if self.local_port == 0 {
                    return Err(TraversalError::InvalidConfig(
                        "listener requires a fixed local port".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Coarse NAT classification from a two-sample mapping comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatClass {
    /// Both samples mapped to the same external address
    Open,
    /// Mappings differed; expect per-destination rewriting
    Restricted,
}

/// Which strategy produced an established connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DirectTcp,
    UdpHolePunch,
    TcpFallback,
    /// The listener's passive accept path
    InboundAccept,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::DirectTcp => "direct TCP",
            Strategy::UdpHolePunch => "UDP hole punch",
            Strategy::TcpFallback => "TCP fallback",
            Strategy::InboundAccept => "inbound accept",
        };
        write!(f, "{}", name)
    }
}

/// A connection handed back to the caller, tagged with the strategy
/// that produced it
#[derive(Debug)]
pub struct Established {
    pub connection: PeerConnection,
    pub strategy: Strategy,
}

/// Connection state machine
///
/// The connector passes through every variant in order. The listener
/// jumps from `ExchangingAddresses` to `Connecting`: its start-time
/// negotiation runs inside the active/passive connection race, so
/// `NegotiatingStart` never shows on the listener side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ResolvingAddress,
    ExchangingAddresses,
    /// Connector only
    NegotiatingStart,
    Connecting,
    Connected,
    Failed(String),
}
