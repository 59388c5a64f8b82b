/**
 * nat_traversal/mod.rs
 *
 * NAT traversal module implementing:
 * - STUN public address discovery
 * - Peer address exchange over a signalling channel
 * - Synchronized multi-strategy hole punching
 * - Handshake-verified connection establishment
 */

mod error;
mod handshake;
mod hole_punching;
mod signalling;
mod stream;
mod stun;
mod sync_start;
mod types;

pub use error::{Result, TraversalError};
pub use hole_punching::{HolePuncher, ProbeSchedule};
pub use signalling::{MemoryChannel, SignallingChannel};
pub use stream::{PeerConnection, UdpStream};
pub use stun::StunClient;
pub use types::{Established, NatClass, PeerAddress, Phase, Role, Strategy, TraversalConfig};

use log::{info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;

/// How long the listener waits for the connector's address, in seconds
const PEER_ADDRESS_WAIT_SECS: u64 = 30;

/// Complete NAT traversal state machine.
///
/// Drives one connection attempt for the configured role: resolve the
/// public address, exchange it with the peer, agree on a start time and
/// run the connection strategies until one of them yields a verified
/// connection.
pub struct NatTraversal<C: SignallingChannel> {
    config: TraversalConfig,
    channel: C,
    puncher: HolePuncher,
    phase: Phase,
}

impl<C: SignallingChannel> NatTraversal<C> {
    /// Create a new traversal run. The configuration is validated here,
    /// before any network activity.
    pub fn new(config: TraversalConfig, channel: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            channel,
            puncher: HolePuncher::new(),
            phase: Phase::Idle,
        })
    }

    /// Current phase of the run
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Execute the traversal for the configured role and hand back the
    /// established connection
    pub async fn run(&mut self) -> Result<Established> {
        let result = match self.config.role {
            Role::Listener => self.run_listener().await,
            Role::Connector => self.run_connector().await,
        };

        self.phase = match &result {
            Ok(established) => {
                info!("connection established via {}", established.strategy);
                Phase::Connected
            }
            Err(e) => Phase::Failed(e.to_string()),
        };

        result
    }

    /// Listener flow: publish own address, then race an active punch
    /// toward the connector against a passive accept on the local port
    async fn run_listener(&mut self) -> Result<Established> {
        self.phase = Phase::ResolvingAddress;
        let own = self.resolve_own_address().await?;
        info!(
            "public address {}:{} (local port {})",
            own.public_ip, own.public_port, own.local_port
        );

        self.phase = Phase::ExchangingAddresses;
        let payload = encode_address(&own)?;
        self.channel.publish(&self.config.local_id, &payload).await?;
        info!("address published, waiting for the peer");

        // the accept socket exists before the race, so an early dial is
        // not lost
        let listener = bind_listener(self.config.local_port)?;

        // Connecting covers the whole race: the active path negotiates
        // the start epoch internally, where the phase field is out of
        // reach
        self.phase = Phase::Connecting;
        let channel = &self.channel;
        let puncher = &self.puncher;
        let config = &self.config;

        let active = async move {
            let payload = channel
                .listen(&config.local_id, PEER_ADDRESS_WAIT_SECS)
                .await?;
            let peer = decode_address(&payload)?;
            info!("peer address {}:{}", peer.public_ip, peer.public_port);

            let epoch = sync_start::negotiate_start_time(channel, &config.local_id, &peer.id).await;
            sync_start::wait_until_epoch(epoch).await;

            puncher
                .establish(
                    peer.public_endpoint(),
                    Duration::from_secs(config.timeout_secs),
                )
                .await
        };
        let passive = accept_one(&listener);

        tokio::pin!(active);
        tokio::pin!(passive);

        let mut active_failed = false;
        let mut passive_failed = false;

        // first success wins and the losing path is dropped along with
        // its sockets; a failed path leaves the other one running
        loop {
            tokio::select! {
                result = &mut active, if !active_failed => match result {
                    Ok(established) => return Ok(established),
                    Err(e) => {
                        if passive_failed {
                            return Err(e);
                        }
                        warn!("active punch path failed: {}, staying passive", e);
                        active_failed = true;
                    }
                },
                result = &mut passive, if !passive_failed => match result {
                    Ok(established) => return Ok(established),
                    Err(e) => {
                        if active_failed {
                            return Err(e);
                        }
                        warn!("inbound accept path failed: {}", e);
                        passive_failed = true;
                    }
                },
            }
        }
    }

    /// Connector flow: look the listener up, announce ourselves, agree
    /// on a start time and run the strategy ladder toward the listener
    async fn run_connector(&mut self) -> Result<Established> {
        let remote_id = match self.config.remote_id.clone() {
            Some(id) => id,
            None => {
                return Err(TraversalError::InvalidConfig(
                    "connector requires a remote id".into(),
                ))
            }
        };

        self.phase = Phase::ResolvingAddress;
        let own = self.resolve_own_address().await?;
        info!("public address {}:{}", own.public_ip, own.public_port);

        self.phase = Phase::ExchangingAddresses;
        // without the listener's address there is nothing to dial
        let payload = self.channel.retrieve(&remote_id).await?;
        let peer = decode_address(&payload)?;
        info!("listener address {}:{}", peer.public_ip, peer.public_port);

        let own_payload = encode_address(&own)?;
        self.channel
            .publish(&self.config.local_id, &own_payload)
            .await?;

        // redundant copy straight to the listener's id; best effort
        if let Err(e) = self.channel.publish(&remote_id, &own_payload).await {
            warn!("failed to send own address to {}: {}", remote_id, e);
        }

        self.phase = Phase::NegotiatingStart;
        let epoch =
            sync_start::negotiate_start_time(&self.channel, &self.config.local_id, &remote_id)
                .await;
        sync_start::wait_until_epoch(epoch).await;

        self.phase = Phase::Connecting;
        self.puncher
            .establish(
                peer.public_endpoint(),
                Duration::from_secs(self.config.timeout_secs),
            )
            .await
    }

    /// Resolve the externally visible address for the configured local
    /// port and assemble this host's published record
    async fn resolve_own_address(&self) -> Result<PeerAddress> {
        let stun = StunClient::new(&self.config.stun_server);
        let (public_ip, public_port) = stun.public_address(self.config.local_port).await?;

        let local_ip = match local_ip() {
            Ok(ip) => ip,
            Err(e) => {
                warn!("failed to get local IP: {}, using 127.0.0.1", e);
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        };

        Ok(PeerAddress {
            id: self.config.local_id.clone(),
            public_ip,
            public_port,
            local_ip,
            local_port: self.config.local_port,
        })
    }
}

/// Accept exactly one inbound TCP connection and verify the handshake
async fn accept_one(listener: &TcpListener) -> Result<Established> {
    let (mut stream, peer) = listener.accept().await.map_err(|e| {
        TraversalError::NetworkUnavailable(format!("Failed to accept connection: {}", e))
    })?;
    info!("inbound connection from {}", peer);

    handshake::verify(&mut stream).await?;

    Ok(Established {
        connection: PeerConnection::Tcp(stream),
        strategy: Strategy::InboundAccept,
    })
}

fn encode_address(address: &PeerAddress) -> Result<String> {
    serde_json::to_string(address).map_err(|e| {
        TraversalError::ProtocolViolation(format!("Failed to encode peer address: {}", e))
    })
}

fn decode_address(payload: &str) -> Result<PeerAddress> {
    serde_json::from_str(payload).map_err(|e| {
        TraversalError::ProtocolViolation(format!("Failed to decode peer address: {}", e))
    })
}

/// Bind the listener's accept socket with address reuse, so a rerun
/// shortly after shutdown can take the same fixed port
fn bind_listener(port: u16) -> Result<TcpListener> {
    let address = SocketAddr::from(([0, 0, 0, 0], port));

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(|e| TraversalError::NetworkUnavailable(format!("Failed to create socket: {}", e)))?;

    socket.set_reuse_address(true).map_err(|e| {
        TraversalError::NetworkUnavailable(format!("Failed to set SO_REUSEADDR: {}", e))
    })?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(|e| {
        TraversalError::NetworkUnavailable(format!("Failed to set SO_REUSEPORT: {}", e))
    })?;

    socket.bind(&address.into()).map_err(|e| {
        TraversalError::NetworkUnavailable(format!("Failed to bind port {}: {}", port, e))
    })?;
    socket
        .listen(1)
        .map_err(|e| TraversalError::NetworkUnavailable(format!("Failed to listen: {}", e)))?;
    socket.set_nonblocking(true).map_err(|e| {
        TraversalError::NetworkUnavailable(format!("Failed to set non-blocking: {}", e))
    })?;

    TcpListener::from_std(socket.into()).map_err(|e| {
        TraversalError::NetworkUnavailable(format!("Failed to register listener: {}", e))
    })
}

/// Local IP as seen on the default route; no packets are sent
fn local_ip() -> Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").map_err(|e| {
        TraversalError::NetworkUnavailable(format!("Failed to bind UDP socket: {}", e))
    })?;
    socket.connect("8.8.8.8:80").map_err(|e| {
        TraversalError::NetworkUnavailable(format!("Failed to pick a route: {}", e))
    })?;
    let address = socket.local_addr().map_err(|e| {
        TraversalError::NetworkUnavailable(format!("Failed to read local address: {}", e))
    })?;
    Ok(address.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector_config(stun_server: String) -> TraversalConfig {
        TraversalConfig {
            role: Role::Connector,
            local_id: "bob".into(),
            remote_id: Some("alice".into()),
            stun_server,
            local_port: 0,
            timeout_secs: 5,
        }
    }

    #[test]
    fn rejects_an_invalid_config_before_any_network_use() {
        let mut config = connector_config("198.51.100.1:3478".into());
        config.remote_id = None;

        let err = match NatTraversal::new(config, MemoryChannel::new()) {
            Ok(_) => panic!("config must be rejected"),
            Err(e) => e,
        };
        assert!(matches!(err, TraversalError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn connector_fails_hard_without_the_listener_address() {
        let stun = stun::testing::spawn_responder([198, 51, 100, 7], 40000).await;
        let config = connector_config(stun.to_string());

        let mut traversal = NatTraversal::new(config, MemoryChannel::new()).unwrap();
        let err = traversal.run().await.unwrap_err();

        assert!(matches!(err, TraversalError::SignallingUnavailable(_)));
        assert!(matches!(traversal.phase(), Phase::Failed(_)));
    }

    #[tokio::test]
    async fn connector_rejects_a_corrupt_listener_record() {
        let stun = stun::testing::spawn_responder([198, 51, 100, 7], 40000).await;
        let config = connector_config(stun.to_string());

        let channel = MemoryChannel::new();
        channel.publish("alice", "definitely not json").await.unwrap();

        let mut traversal = NatTraversal::new(config, channel).unwrap();
        let err = traversal.run().await.unwrap_err();
        assert!(matches!(err, TraversalError::ProtocolViolation(_)));
    }

    #[test]
    fn bound_listener_port_is_released_on_drop() {
        tokio_test::block_on(async {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = probe.local_addr().unwrap().port();
            drop(probe);

            let listener = bind_listener(port).unwrap();
            drop(listener);

            // reuse flags let the port be taken again right away
            let listener = bind_listener(port).unwrap();
            drop(listener);
        });
    }
}
