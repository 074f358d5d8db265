//! Randomized, retry-bounded gossip dispatch.
//!
//! Each dispatch notifies up to `branch_factor` peers drawn uniformly from
//! the full peer roster. A draw that repeats the previous index is discarded;
//! a round ends once `rechoose_limit` draws have been discarded, and at most
//! `retries` rounds are attempted. Delivery is fire-and-forget: unreachable peers show up later as
//! state changes, never as a dispatch failure.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::config::GossipConfig;
use crate::event::{MessageType, RegistryUpdateDigest, RemoteEvent, SequenceGenerator};
use crate::peer::PeerHandle;

/// Picks roster indices to notify for one dispatch.
///
/// Returns at most `config.branch_factor` indices, each below `roster_len`,
/// where no index equals the one chosen just before it. With a single peer
/// the peer is chosen once and the remaining draws are spent as redraws.
///
/// Each draw is reduced modulo `roster_len`, the full roster, not the count
/// of available peers: an empty available set never reaches the modulo, and
/// unavailable peers stay eligible so a delivery can promote them.
#[must_use]
pub fn select_targets<R: Rng + ?Sized>(
    config: &GossipConfig,
    roster_len: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut chosen = Vec::with_capacity(config.branch_factor);
    if roster_len == 0 || config.branch_factor == 0 {
        return chosen;
    }

    let upper = config.network_size_limit.max(1);
    let mut last: Option<usize> = None;

    for round in 0..config.retries {
        let mut rechosen = 0;
        while chosen.len() < config.branch_factor && rechosen < config.rechoose_limit {
            let index = rng.gen_range(0..upper) % roster_len;
            if last == Some(index) {
                rechosen += 1;
                continue;
            }
            chosen.push(index);
            last = Some(index);
        }

        if chosen.len() >= config.branch_factor {
            break;
        }
        trace!(round, chosen = chosen.len(), "gossip round ended short of branch factor");
    }

    chosen
}

/// Builds gossip envelopes and sends them to randomly selected peers.
///
/// Safe to call from many tasks at once: the random source is locked only
/// while indices are drawn.
pub struct GossipDispatcher {
    config: GossipConfig,
    local_service_url: String,
    sequence: SequenceGenerator,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for GossipDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipDispatcher")
            .field("config", &self.config)
            .field("local_service_url", &self.local_service_url)
            .finish_non_exhaustive()
    }
}

impl GossipDispatcher {
    /// Creates a dispatcher that stamps `local_service_url` as the source of
    /// every envelope.
    #[must_use]
    pub fn new(config: GossipConfig, local_service_url: impl Into<String>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            local_service_url: local_service_url.into(),
            sequence: SequenceGenerator::new(),
            rng: Mutex::new(rng),
        }
    }

    /// The gossip parameters in use.
    #[must_use]
    pub const fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Wraps `digest` in a Register event with a fresh sequence number and
    /// a TTL of zero.
    #[must_use]
    pub fn envelope(&self, digest: &RegistryUpdateDigest) -> RemoteEvent {
        RemoteEvent::new(
            self.local_service_url.clone(),
            MessageType::Register,
            Some(digest.xml_document().to_string()),
            digest.xml_checksum(),
            self.sequence.next_seq(),
            0,
        )
    }

    /// Sends `digest` to peers drawn from `roster`.
    ///
    /// Always returns true; there is no acknowledgment to wait for.
    pub fn dispatch(&self, roster: &[Arc<PeerHandle>], digest: &RegistryUpdateDigest) -> bool {
        if roster.is_empty() {
            debug!("no known peers, skipping gossip dispatch");
            return true;
        }

        let envelope = self.envelope(digest);
        let targets = {
            let mut rng = self.rng.lock();
            select_targets(&self.config, roster.len(), &mut *rng)
        };

        for index in &targets {
            let peer = &roster[*index];
            debug!(
                peer = %peer.name(),
                seq = envelope.sequence_number(),
                available = peer.is_available(),
                "gossiping registry state"
            );
            peer.send(envelope.clone());
        }

        debug!(
            roster = roster.len(),
            notified = targets.len(),
            checksum = %digest.xml_checksum(),
            "gossip dispatch complete"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::peer::PeerIdentity;
    use crate::transport::{MemoryTransport, PeerTransport};
    use rand::rngs::mock::StepRng;
    use rand::RngCore;
    use test_case::test_case;

    fn seeded(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    // ========== select_targets Tests ==========

    #[test]
    fn test_empty_roster_selects_nothing() {
        let config = GossipConfig::default();
        assert!(select_targets(&config, 0, &mut seeded(1)).is_empty());
    }

    #[test]
    fn test_single_peer_is_chosen_once_and_terminates() {
        let config = GossipConfig::default();
        for seed in 0..50 {
            assert_eq!(select_targets(&config, 1, &mut seeded(seed)), vec![0]);
        }
    }

    #[test]
    fn test_two_peers_both_notified() {
        let config = GossipConfig::new().with_rechoose_limit(16);
        for seed in 0..50 {
            let mut targets = select_targets(&config, 2, &mut seeded(seed));
            targets.sort_unstable();
            assert_eq!(targets, vec![0, 1], "seed {seed}");
        }
    }

    #[test]
    fn test_branch_factor_caps_selection() {
        let config = GossipConfig::new().with_branch_factor(3);
        let targets = select_targets(&config, 50, &mut seeded(9));
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn test_tiny_draw_range_still_terminates() {
        // Every draw lands on index 0.
        let config = GossipConfig::new().with_network_size_limit(1);
        assert_eq!(select_targets(&config, 5, &mut seeded(3)), vec![0]);
    }

    /// Counts how many values are drawn from a constant source.
    struct CountingRng {
        inner: StepRng,
        draws: usize,
    }

    impl CountingRng {
        fn constant() -> Self {
            Self {
                inner: StepRng::new(0, 0),
                draws: 0,
            }
        }
    }

    impl RngCore for CountingRng {
        fn next_u32(&mut self) -> u32 {
            self.draws += 1;
            self.inner.next_u32()
        }

        fn next_u64(&mut self) -> u64 {
            self.draws += 1;
            self.inner.next_u64()
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            self.draws += 1;
            self.inner.fill_bytes(dest);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.draws += 1;
            self.inner.try_fill_bytes(dest)
        }
    }

    #[test_case(1 ; "one")]
    #[test_case(4 ; "default")]
    fn test_discarded_draws_never_exceed_rechoose_limit(limit: usize) {
        let config = GossipConfig::new().with_retries(1).with_rechoose_limit(limit);
        let mut rng = CountingRng::constant();

        assert_eq!(select_targets(&config, 1, &mut rng), vec![0]);
        // One accepted draw, then exactly `limit` discarded repeats.
        assert_eq!(rng.draws, 1 + limit);
    }

    #[test]
    fn test_rechoose_budget_resets_each_round() {
        let config = GossipConfig::new().with_retries(3).with_rechoose_limit(2);
        let mut rng = CountingRng::constant();

        assert_eq!(select_targets(&config, 1, &mut rng), vec![0]);
        assert_eq!(rng.draws, 1 + 3 * 2);
    }

    // ========== GossipDispatcher Tests ==========

    #[test]
    fn test_envelope_is_register_with_zero_ttl() {
        let gossip = GossipDispatcher::new(GossipConfig::default(), "http://a");
        let digest = RegistryUpdateDigest::new(vec![], "<registration/>", "c0ffee");

        let first = gossip.envelope(&digest);
        let second = gossip.envelope(&digest);

        assert_eq!(first.source(), "http://a");
        assert_eq!(first.message_type(), MessageType::Register);
        assert_eq!(first.payload(), Some("<registration/>"));
        assert_eq!(first.checksum(), "c0ffee");
        assert_eq!(first.time_to_live(), 0);
        assert!(second.sequence_number() > first.sequence_number());
    }

    #[tokio::test]
    async fn test_dispatch_with_no_peers_returns_true() {
        let gossip = GossipDispatcher::new(GossipConfig::default(), "http://a");
        let digest = RegistryUpdateDigest::new(vec![], "<doc/>", "sum");
        assert!(gossip.dispatch(&[], &digest));
    }

    #[tokio::test]
    async fn test_dispatch_sends_to_two_distinct_peers() {
        let transport = Arc::new(MemoryTransport::new());
        let roster: Vec<_> = ["http://b", "http://c", "http://d"]
            .into_iter()
            .map(|url| {
                PeerHandle::spawn(
                    PeerIdentity::from_service_url(url),
                    Arc::clone(&transport) as Arc<dyn PeerTransport>,
                    &PeerConfig::default(),
                )
            })
            .collect();
        let gossip = GossipDispatcher::new(GossipConfig::new().with_rng_seed(42), "http://a");
        let digest = RegistryUpdateDigest::new(vec![], "<doc/>", "sum");

        assert!(gossip.dispatch(&roster, &digest));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while transport.sent_count() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("two deliveries");

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].0, sent[1].0);
        assert!(sent.iter().all(|(_, ev)| ev.time_to_live() == 0));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_selection_respects_bounds(
                roster_len in 0usize..40,
                branch_factor in 1usize..5,
                retries in 1usize..5,
                rechoose_limit in 1usize..6,
                seed in any::<u64>(),
            ) {
                let config = GossipConfig::new()
                    .with_branch_factor(branch_factor)
                    .with_retries(retries)
                    .with_rechoose_limit(rechoose_limit);
                let targets = select_targets(&config, roster_len, &mut seeded(seed));

                prop_assert!(targets.len() <= branch_factor);
                prop_assert!(targets.iter().all(|&i| i < roster_len));
                prop_assert!(targets.windows(2).all(|w| w[0] != w[1]));
                if roster_len == 0 {
                    prop_assert!(targets.is_empty());
                }
            }

            #[test]
            fn test_default_parameters_notify_two_distinct(
                roster_len in 3usize..200,
                seed in any::<u64>(),
            ) {
                let targets = select_targets(&GossipConfig::default(), roster_len, &mut seeded(seed));
                prop_assert_eq!(targets.len(), 2);
                prop_assert_ne!(targets[0], targets[1]);
            }
        }
    }
}
