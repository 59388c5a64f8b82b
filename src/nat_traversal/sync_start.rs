/**
 * nat_traversal/sync_start.rs
 *
 * Start time negotiation so both sides begin punching together
 */

use log::{info, warn};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, timeout};

use super::signalling::SignallingChannel;

/// Wire tag carrying a proposed start instant, in Unix seconds
pub const START_TIME_PREFIX: &str = "HOLE_PUNCH_START_TIME_";

/// How far ahead of now a fresh proposal points
const PROPOSAL_LEAD: Duration = Duration::from_secs(5);

/// Total window spent waiting for the peer's reciprocal proposal
const NEGOTIATION_WINDOW: Duration = Duration::from_secs(8);

/// Per-poll listen timeout inside the window, in seconds
const POLL_TIMEOUT_SECS: u64 = 1;

/// Agree on a start instant with the peer.
///
/// Proposes `now + 5s` under the peer's id, then polls the own id for a
/// reciprocal proposal for up to 8 seconds. When one arrives, the later
/// of the two instants is adopted, so neither side starts before an
/// instant it proposed itself; otherwise the local proposal stands.
/// Signalling failures fall back to the local proposal, never to an
/// error.
pub async fn negotiate_start_time<C: SignallingChannel>(
    channel: &C,
    local_id: &str,
    peer_id: &str,
) -> u64 {
    negotiate_with_window(channel, local_id, peer_id, PROPOSAL_LEAD, NEGOTIATION_WINDOW).await
}

async fn negotiate_with_window<C: SignallingChannel>(
    channel: &C,
    local_id: &str,
    peer_id: &str,
    lead: Duration,
    window: Duration,
) -> u64 {
    let proposal = unix_now() + lead.as_secs();
    info!("proposing start time {}", proposal);

    let message = format!("{}{}", START_TIME_PREFIX, proposal);
    if let Err(e) = channel.publish(peer_id, &message).await {
        warn!("failed to send start time proposal: {}", e);
    }

    // one bounded window covers the whole poll loop
    let peer_proposal = timeout(window, async {
        loop {
            match channel.listen(local_id, POLL_TIMEOUT_SECS).await {
                Ok(payload) => {
                    if let Some(instant) = parse_start_time(&payload) {
                        return instant;
                    }
                }
                Err(_) => {} // nothing yet, keep polling
            }
        }
    })
    .await;

    match peer_proposal {
        Ok(peer) => {
            let adopted = proposal.max(peer);
            info!("synchronized on start time {}", adopted);
            adopted
        }
        Err(_) => {
            info!("no reciprocal proposal, using start time {}", proposal);
            proposal
        }
    }
}

/// Extract the proposed instant from a tagged payload
fn parse_start_time(payload: &str) -> Option<u64> {
    payload.strip_prefix(START_TIME_PREFIX)?.parse().ok()
}

/// Sleep until the wall clock reaches `epoch`; past instants return
/// immediately
pub async fn wait_until_epoch(epoch: u64) {
    let now = unix_now();
    if epoch > now {
        let wait = Duration::from_secs(epoch - now);
        info!("waiting {:?} until the synchronized start", wait);
        sleep(wait).await;
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the Unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat_traversal::signalling::MemoryChannel;

    #[test]
    fn parses_only_the_exact_prefix_with_decimal_seconds() {
        assert_eq!(
            parse_start_time("HOLE_PUNCH_START_TIME_1700000000"),
            Some(1700000000)
        );
        assert_eq!(parse_start_time("HOLE_PUNCH_START_TIME_"), None);
        assert_eq!(parse_start_time("HOLE_PUNCH_START_TIME_abc"), None);
        assert_eq!(parse_start_time("XHOLE_PUNCH_START_TIME_5"), None);
        assert_eq!(parse_start_time("something else entirely"), None);
    }

    /// Publish a payload under `id` every 50ms until aborted, so the
    /// poll loop cannot miss it to subscription timing
    fn spawn_feeder(
        channel: &MemoryChannel,
        id: &str,
        payload: String,
    ) -> tokio::task::JoinHandle<()> {
        let channel = channel.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            loop {
                let _ = channel.publish(&id, &payload).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
    }

    #[tokio::test]
    async fn adopts_the_later_peer_proposal() {
        let channel = MemoryChannel::new();
        let peer_instant = unix_now() + 600;
        let feeder = spawn_feeder(
            &channel,
            "alice",
            format!("{}{}", START_TIME_PREFIX, peer_instant),
        );

        let adopted = negotiate_with_window(
            &channel,
            "alice",
            "bob",
            Duration::from_secs(5),
            Duration::from_secs(3),
        )
        .await;

        assert_eq!(adopted, peer_instant);
        feeder.abort();
    }

    #[tokio::test]
    async fn keeps_the_local_proposal_against_an_earlier_peer() {
        let channel = MemoryChannel::new();
        let stale = unix_now() - 100;
        let feeder = spawn_feeder(
            &channel,
            "alice",
            format!("{}{}", START_TIME_PREFIX, stale),
        );

        let before = unix_now();
        let adopted = negotiate_with_window(
            &channel,
            "alice",
            "bob",
            Duration::from_secs(5),
            Duration::from_secs(3),
        )
        .await;
        let after = unix_now();

        // the stale instant lost to the local now+5 proposal
        assert!(adopted >= before + 5 && adopted <= after + 5);
        feeder.abort();
    }

    #[tokio::test]
    async fn falls_back_to_the_local_proposal_when_the_window_expires() {
        let channel = MemoryChannel::new();

        let before = unix_now();
        let adopted = negotiate_with_window(
            &channel,
            "alice",
            "bob",
            Duration::from_secs(5),
            Duration::from_millis(300),
        )
        .await;
        let after = unix_now();

        assert!(adopted >= before + 5 && adopted <= after + 5);
        // the outgoing proposal still reached the peer's topic
        assert!(channel
            .retrieve("bob")
            .await
            .unwrap()
            .starts_with(START_TIME_PREFIX));
    }

    #[tokio::test]
    async fn garbage_payloads_are_skipped_while_polling() {
        let channel = MemoryChannel::new();
        let peer_instant = unix_now() + 300;
        let channel_for_feeder = channel.clone();
        let peer_message = format!("{}{}", START_TIME_PREFIX, peer_instant);
        let feeder = tokio::spawn(async move {
            loop {
                let _ = channel_for_feeder.publish("alice", "not a proposal").await;
                tokio::time::sleep(Duration::from_millis(25)).await;
                let _ = channel_for_feeder.publish("alice", &peer_message).await;
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        });

        let adopted = negotiate_with_window(
            &channel,
            "alice",
            "bob",
            Duration::from_secs(5),
            Duration::from_secs(3),
        )
        .await;

        assert_eq!(adopted, peer_instant);
        feeder.abort();
    }

    #[tokio::test]
    async fn past_epochs_do_not_block() {
        let start = std::time::Instant::now();
        wait_until_epoch(unix_now() - 10).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn future_epochs_wait_on_the_timer() {
        // the paused clock auto-advances the sleep; the call only has
        // to complete
        wait_until_epoch(unix_now() + 2).await;
    }
}
