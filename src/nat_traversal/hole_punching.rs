/**
 * nat_traversal/hole_punching.rs
 *
 * Strategy ladder for reaching one remote endpoint: direct TCP, UDP
 * hole punching across a port offset search, then a TCP retry
 */

use log::{debug, info, trace};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

use super::error::{Result, TraversalError};
use super::handshake;
use super::stream::{PeerConnection, UdpStream};
use super::types::{Established, Strategy};

/// Remote port offsets tried in order; NATs that rewrite ports tend to
/// assign mappings near the advertised one
const PORT_OFFSETS: [i32; 7] = [0, 1, -1, 2, -2, 3, -3];

/// Probing timetable for one candidate port. Round `r` (1-indexed)
/// sends `base_probes + r * extra_probes_per_round` probes, after which
/// the socket listens for `listen_window`. `Default` is the production
/// schedule; tests compress it.
#[derive(Debug, Clone)]
pub struct ProbeSchedule {
    /// Rounds per candidate port
    pub rounds: u32,
    /// Baseline probe count
    pub base_probes: u32,
    /// Probes added for each round number
    pub extra_probes_per_round: u32,
    /// Delay after the first probe of a round
    pub base_interval: Duration,
    /// Interval growth per probe within a round
    pub interval_step: Duration,
    /// Interval ceiling
    pub max_interval: Duration,
    /// Listen window after each round's burst
    pub listen_window: Duration,
    /// Pause between failed rounds
    pub round_pause: Duration,
}

impl Default for ProbeSchedule {
    fn default() -> Self {
        Self {
            rounds: 3,
            base_probes: 10,
            extra_probes_per_round: 5,
            base_interval: Duration::from_millis(200),
            interval_step: Duration::from_millis(10),
            max_interval: Duration::from_millis(500),
            listen_window: Duration::from_secs(3),
            round_pause: Duration::from_secs(1),
        }
    }
}

/// Runs the strategy ladder against one remote endpoint
pub struct HolePuncher {
    schedule: ProbeSchedule,
}

impl Default for HolePuncher {
    fn default() -> Self {
        Self::new()
    }
}

impl HolePuncher {
    pub fn new() -> Self {
        Self {
            schedule: ProbeSchedule::default(),
        }
    }

    /// Use a custom probing timetable
    pub fn with_schedule(schedule: ProbeSchedule) -> Self {
        Self { schedule }
    }

    /// Establish a connection to `remote`: direct TCP first, then UDP
    /// hole punching over the port offset search, then one TCP retry.
    /// The first success wins and later strategies are never attempted.
    ///
    /// `budget` bounds each TCP dial; the UDP phase runs its fixed
    /// schedule and is not bounded by it.
    pub async fn establish(&self, remote: SocketAddr, budget: Duration) -> Result<Established> {
        match self.dial_tcp(remote, budget).await {
            Ok(stream) => {
                info!("direct TCP connection to {} established", remote);
                return Ok(Established {
                    connection: PeerConnection::Tcp(stream),
                    strategy: Strategy::DirectTcp,
                });
            }
            Err(e) => debug!("direct TCP to {} failed: {}", remote, e),
        }

        match self.punch_udp(remote).await {
            Ok(stream) => {
                info!("UDP hole punched to {}", stream.peer_addr());
                return Ok(Established {
                    connection: PeerConnection::Udp(stream),
                    strategy: Strategy::UdpHolePunch,
                });
            }
            Err(e) => debug!("UDP hole punching toward {} failed: {}", remote, e),
        }

        match self.dial_tcp(remote, budget).await {
            Ok(stream) => {
                info!("TCP fallback connection to {} established", remote);
                return Ok(Established {
                    connection: PeerConnection::Tcp(stream),
                    strategy: Strategy::TcpFallback,
                });
            }
            Err(e) => debug!("TCP fallback to {} failed: {}", remote, e),
        }

        Err(TraversalError::AllStrategiesExhausted)
    }

    /// Dial one TCP connection and verify the handshake on it
    async fn dial_tcp(&self, remote: SocketAddr, budget: Duration) -> Result<TcpStream> {
        let mut stream = timeout(budget, TcpStream::connect(remote))
            .await
            .map_err(|_| {
                TraversalError::Timeout(format!("No TCP connection to {} within {:?}", remote, budget))
            })?
            .map_err(|e| {
                TraversalError::NetworkUnavailable(format!("TCP dial to {} failed: {}", remote, e))
            })?;

        handshake::verify(&mut stream).await?;
        Ok(stream)
    }

    /// Walk the candidate ports in offset order; first answer wins
    async fn punch_udp(&self, remote: SocketAddr) -> Result<UdpStream> {
        for offset in PORT_OFFSETS {
            let port = remote.port() as i32 + offset;
            if !(1024..=65535).contains(&port) {
                trace!("skipping out-of-range candidate port {}", port);
                continue;
            }
            let candidate = SocketAddr::new(remote.ip(), port as u16);

            match self.punch_candidate(candidate).await {
                Ok(stream) => return Ok(stream),
                Err(e) => debug!("candidate {} (offset {:+}) failed: {}", candidate, offset, e),
            }
        }

        Err(TraversalError::Timeout(
            "No candidate port answered any probe round".into(),
        ))
    }

    /// Probe one candidate port from a fresh ephemeral socket. Success
    /// is any datagram arriving from the candidate address; the payload
    /// is not inspected.
    async fn punch_candidate(&self, candidate: SocketAddr) -> Result<UdpStream> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
            TraversalError::NetworkUnavailable(format!("Failed to bind UDP socket: {}", e))
        })?;

        let schedule = &self.schedule;
        for round in 1..=schedule.rounds {
            debug!(
                "hole punch round {}/{} toward {}",
                round, schedule.rounds, candidate
            );

            let probes = schedule.base_probes + round * schedule.extra_probes_per_round;
            for index in 0..probes {
                let probe = format!("HOLE_PUNCH_PROBE_R{}_P{}", round, index);
                socket
                    .send_to(probe.as_bytes(), candidate)
                    .await
                    .map_err(|e| {
                        TraversalError::NetworkUnavailable(format!(
                            "Failed to send probe: {}",
                            e
                        ))
                    })?;
                trace!("probe {}/{} sent (round {})", index + 1, probes, round);

                let interval = schedule.base_interval + schedule.interval_step * index;
                sleep(interval.min(schedule.max_interval)).await;
            }

            match timeout(
                schedule.listen_window,
                wait_for_peer_datagram(&socket, candidate),
            )
            .await
            {
                Ok(Ok(())) => {
                    debug!("inbound datagram from {} in round {}", candidate, round);
                    return Ok(UdpStream::new(socket, candidate));
                }
                Ok(Err(e)) => {
                    return Err(TraversalError::NetworkUnavailable(format!(
                        "Failed while listening for the peer: {}",
                        e
                    )));
                }
                Err(_) => {
                    if round < schedule.rounds {
                        sleep(schedule.round_pause).await;
                    }
                }
            }
        }

        Err(TraversalError::Timeout(format!(
            "No response from {} after {} rounds",
            candidate, schedule.rounds
        )))
    }
}

/// Wait for any datagram whose source is `peer`; others are ignored
async fn wait_for_peer_datagram(socket: &UdpSocket, peer: SocketAddr) -> std::io::Result<()> {
    let mut buffer = [0u8; 1024];
    loop {
        let (_, from) = socket.recv_from(&mut buffer).await?;
        if from == peer {
            return Ok(());
        }
        trace!("ignoring datagram from {} while waiting for {}", from, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn quick_schedule() -> ProbeSchedule {
        ProbeSchedule {
            rounds: 3,
            base_probes: 1,
            extra_probes_per_round: 0,
            base_interval: Duration::from_millis(5),
            interval_step: Duration::from_millis(0),
            max_interval: Duration::from_millis(10),
            listen_window: Duration::from_millis(150),
            round_pause: Duration::from_millis(10),
        }
    }

    /// TCP acceptor that echoes whatever arrives, satisfying the
    /// handshake, and counts accepted connections
    async fn spawn_echo_acceptor() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(connection) => connection,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    if let Ok(n) = stream.read(&mut buf).await {
                        let _ = stream.write_all(&buf[..n]).await;
                    }
                });
            }
        });

        (addr, accepted)
    }

    /// Binds a TCP target plus a UDP watcher on every candidate port
    /// around it, retrying until a block with all seven free is found
    async fn bind_candidate_block() -> (TcpListener, Vec<UdpSocket>) {
        'outer: for _ in 0..32 {
            let listener = match TcpListener::bind("127.0.0.1:0").await {
                Ok(listener) => listener,
                Err(_) => continue,
            };
            let addr = listener.local_addr().unwrap();
            if addr.port() < 1027 || addr.port() > 65532 {
                continue;
            }

            let mut watchers = Vec::with_capacity(PORT_OFFSETS.len());
            for offset in PORT_OFFSETS {
                let candidate = (addr.port() as i32 + offset) as u16;
                match UdpSocket::bind(SocketAddr::new(addr.ip(), candidate)).await {
                    Ok(watcher) => watchers.push(watcher),
                    Err(_) => continue 'outer,
                }
            }
            return (listener, watchers);
        }
        panic!("no contiguous candidate port block available");
    }

    #[tokio::test]
    async fn direct_tcp_wins_without_any_probing() {
        let (addr, accepted) = spawn_echo_acceptor().await;
        // a UDP socket on the same ip:port catches stray offset-0 probes
        let guard = UdpSocket::bind(addr).await.unwrap();

        let puncher = HolePuncher::with_schedule(quick_schedule());
        let established = puncher.establish(addr, Duration::from_secs(1)).await.unwrap();

        assert_eq!(established.strategy, Strategy::DirectTcp);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        let mut buf = [0u8; 64];
        assert!(guard.try_recv_from(&mut buf).is_err(), "saw UDP probes");
    }

    #[tokio::test]
    async fn selects_offset_two_when_the_peer_answers_there_in_round_two() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        // advertise an endpoint two below the responder, so only the +2
        // candidate can ever be answered
        let remote = SocketAddr::new(responder_addr.ip(), responder_addr.port() - 2);

        // the +3 and -3 candidates must never see a probe
        let plus_three =
            UdpSocket::bind(SocketAddr::new(remote.ip(), remote.port() + 3)).await.ok();
        let minus_three =
            UdpSocket::bind(SocketAddr::new(remote.ip(), remote.port() - 3)).await.ok();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (n, from) = match responder.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(_) => return,
                };
                // stay quiet through round one
                if buf[..n].starts_with(b"HOLE_PUNCH_PROBE_R1") {
                    continue;
                }
                // arbitrary payload; only the source address matters
                let _ = responder.send_to(b"anything", from).await;
            }
        });

        let puncher = HolePuncher::with_schedule(quick_schedule());
        let established = puncher
            .establish(remote, Duration::from_millis(200))
            .await
            .unwrap();

        assert_eq!(established.strategy, Strategy::UdpHolePunch);
        match &established.connection {
            PeerConnection::Udp(stream) => assert_eq!(stream.peer_addr(), responder_addr),
            other => panic!("expected a UDP connection, got {:?}", other),
        }

        let mut buf = [0u8; 64];
        if let Some(guard) = plus_three {
            assert!(guard.try_recv_from(&mut buf).is_err(), "offset +3 saw probes");
        }
        if let Some(guard) = minus_three {
            assert!(guard.try_recv_from(&mut buf).is_err(), "offset -3 saw probes");
        }
    }

    #[tokio::test]
    async fn punched_stream_carries_data_both_ways() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let remote = peer_addr;

        let peer_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            // first probe opens the path; answer it
            let (_, from) = peer.recv_from(&mut buf).await.unwrap();
            peer.send_to(b"opened", from).await.unwrap();

            // then wait for application data, skipping leftover probes
            loop {
                let (n, from) = peer.recv_from(&mut buf).await.unwrap();
                if &buf[..n] == b"hello peer" {
                    peer.send_to(b"hello back", from).await.unwrap();
                    return;
                }
            }
        });

        let puncher = HolePuncher::with_schedule(quick_schedule());
        let established = puncher
            .establish(remote, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(established.strategy, Strategy::UdpHolePunch);

        let mut connection = established.connection;
        connection.write_all(b"hello peer").await.unwrap();
        let mut buf = [0u8; 64];
        let n = connection
            .read_timeout(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"hello back");

        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn exhaustion_makes_two_tcp_attempts_and_probes_every_round() {
        // acceptor that drops connections immediately, so every TCP
        // strategy fails at the handshake
        let (listener, watchers) = bind_candidate_block().await;
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        {
            let counter = accepted.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(connection) => connection,
                        Err(_) => return,
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                }
            });
        }

        // every candidate port records which rounds reached it
        let pairs_seen = Arc::new(std::sync::Mutex::new(BTreeSet::new()));
        for watcher in watchers {
            let candidate = watcher.local_addr().unwrap().port();
            let pairs = pairs_seen.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                loop {
                    let (n, _) = match watcher.recv_from(&mut buf).await {
                        Ok(received) => received,
                        Err(_) => return,
                    };
                    if let Ok(text) = std::str::from_utf8(&buf[..n]) {
                        if let Some(rest) = text.strip_prefix("HOLE_PUNCH_PROBE_R") {
                            if let Some((round, _)) = rest.split_once("_P") {
                                if let Ok(round) = round.parse::<u32>() {
                                    pairs.lock().unwrap().insert((candidate, round));
                                }
                            }
                        }
                    }
                }
            });
        }

        let puncher = HolePuncher::with_schedule(quick_schedule());
        let err = puncher
            .establish(addr, Duration::from_millis(500))
            .await
            .unwrap_err();

        assert!(matches!(err, TraversalError::AllStrategiesExhausted));
        // one direct dial plus one fallback dial, nothing more
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        // the last datagrams may still be in flight to the watchers
        tokio::time::sleep(Duration::from_millis(50)).await;

        // all seven candidates crossed with rounds 1-3: 21 pairs
        let expected: BTreeSet<(u16, u32)> = PORT_OFFSETS
            .iter()
            .flat_map(|&offset| {
                let candidate = (addr.port() as i32 + offset) as u16;
                (1..=3u32).map(move |round| (candidate, round))
            })
            .collect();
        assert_eq!(expected.len(), 21);
        assert_eq!(*pairs_seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn ignores_datagrams_from_unrelated_sources() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // the responder tells the intruder where the probes came from,
        // and only the intruder answers
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (_, from) = match responder.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(_) => return,
                };
                let _ = intruder.send_to(b"not the peer", from).await;
            }
        });

        let mut schedule = quick_schedule();
        schedule.rounds = 1;
        let puncher = HolePuncher::with_schedule(schedule);

        // every candidate stays silent from the expected source, so the
        // whole UDP phase must fail despite the intruder's traffic
        let err = puncher
            .establish(responder_addr, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TraversalError::AllStrategiesExhausted));
    }
}
