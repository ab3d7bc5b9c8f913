use crate::bloom::BloomFilter;
use crate::commit::{now_ms, Commit};
use crate::config::Config;
use crate::error::Metrics;
use crate::message::SyncMessage;
use crate::scheduler::{Priority, Scheduler};
use crate::store::{CommitStore, PutOutcome};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Computes the adaptive false-positive rate for a filter sized to cover
/// `n = max(1, local, peer)` elements, targeting `expected_cycles`
/// round-trips to convergence, per spec §4.4:
///
/// `fpr = min(0.5, n ^ (-1 / (0.5 * C)))`
///
/// `low_accuracy` forces `0.5` directly (smallest filter, worst FPR) when
/// bandwidth matters more than round-trip count.
pub fn adaptive_fpr(local: u64, peer: u64, expected_cycles: u32, low_accuracy: bool) -> f64 {
    if low_accuracy {
        return 0.5;
    }
    let n = local.max(peer).max(1) as f64;
    let c = (expected_cycles.max(1)) as f64;
    let fpr = n.powf(-1.0 / (0.5 * c));
    fpr.min(0.5)
}

/// Cardinality hint used to size a freshly built filter.
fn filter_size(local: u64, peer: u64) -> usize {
    local.max(peer).max(1) as usize
}

/// Result of building an outbound message: the message itself, plus the
/// recounted local cardinality observed while scanning (the iterator is
/// the source of truth, spec §4.4 step 3).
pub struct BuildOutcome {
    /// The message ready to ship to the peer.
    pub message: SyncMessage,
    /// Local cardinality observed during this scan.
    pub recounted_size: u64,
}

/// Tracks how long the previous cycle took, for pacing decisions.
#[derive(Clone)]
pub struct Pacer {
    last_cycle: Arc<AtomicU64>,
    last_activity: Arc<AtomicU64>,
    floor: Duration,
    ceiling: Duration,
}

impl Pacer {
    /// `floor`/`ceiling` bound the cycle interval this pacer will suggest.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            last_cycle: Arc::new(AtomicU64::new(floor.as_millis() as u64)),
            last_activity: Arc::new(AtomicU64::new(0)),
            floor,
            ceiling,
        }
    }

    /// Records the wall-clock latency of a just-finished cycle.
    pub fn record_cycle_latency(&self, latency: Duration) {
        self.last_cycle
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Records a count of locally observed writes since the last cycle,
    /// the other half of the pacing signal.
    pub fn record_activity(&self, writes_since_last_cycle: u64) {
        self.last_activity
            .store(writes_since_last_cycle, Ordering::Relaxed);
    }

    /// The interval until the next cycle should run. Rises (slower cadence)
    /// when latency or activity is high, falls (faster cadence) when both
    /// are low — spec §4.4's "cycle pacing".
    pub fn next_interval(&self) -> Duration {
        let latency_ms = self.last_cycle.load(Ordering::Relaxed);
        let activity = self.last_activity.load(Ordering::Relaxed);
        // Activity pushes the interval up sub-linearly so a single noisy
        // cycle doesn't immediately stall the peer for a long time.
        let activity_penalty_ms = (activity as f64).sqrt() as u64 * 10;
        let suggested = Duration::from_millis(latency_ms.saturating_add(activity_penalty_ms));
        suggested.clamp(self.floor, self.ceiling)
    }
}

/// Drives sync cycles for one org against one `CommitStore`.
pub struct SyncEngine<S> {
    store: S,
    config: Config,
    build_version: u32,
    metrics: Arc<Metrics>,
    pacer: Pacer,
}

impl<S: CommitStore> SyncEngine<S> {
    /// Wraps a store with the config and protocol version this engine
    /// will present to peers.
    pub fn new(store: S, config: Config, build_version: u32, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            config,
            build_version,
            metrics,
            pacer: Pacer::new(Duration::from_millis(200), Duration::from_secs(60)),
        }
    }

    /// Shared counters for this engine's recoverable conditions.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Pacing handle; record cycle latency against it after each
    /// [`Self::build_message`]/[`Self::process_message`] round.
    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    /// Builds an outbound message for `repo_id` against the peer's last
    /// known filter (`peer_filter`) and cardinality (`peer_size`).
    ///
    /// Implements spec §4.4 verbatim:
    /// 1. a fresh local bloom sized for `n = max(1, L, P)` at the adaptive FPR;
    /// 2. scan the store, narrowed to the `ttl_ms` window (spec §3/§6:
    ///    "window of commits considered for sync") — anything older is
    ///    dropped before it ever reaches the filter or the missing set;
    /// 3. if there's no peer filter, or `include_missing` is off, just fill
    ///    the local filter — no missing-values accumulation;
    /// 4. otherwise also check each ID against the peer filter and collect
    ///    the commits it's missing;
    /// 5. emit filter + recounted size + missing values.
    pub async fn build_message(
        &self,
        repo_id: &str,
        peer_filter: Option<&BloomFilter>,
        local_size: u64,
        peer_size: u64,
    ) -> anyhow::Result<BuildOutcome> {
        let span = tracing::info_span!("sync_cycle_build", repo = %repo_id, org = %self.store.org_id());
        let _enter = span.enter();

        let fpr = adaptive_fpr(
            local_size,
            peer_size,
            self.config.expected_sync_cycles,
            self.config.low_accuracy,
        );
        let size = filter_size(local_size, peer_size);
        tracing::debug!(fpr, size, "sizing outbound filter");
        let mut filter = BloomFilter::new(size, fpr);

        let want_missing = peer_filter.is_some() && self.config.include_missing;

        let now = now_ms();
        let ttl_ms = self.config.ttl_ms;
        let items: Vec<(String, Commit)> = self
            .store
            .scan(repo_id)?
            .collect::<anyhow::Result<Vec<_>>>()?
            .into_iter()
            .filter(|(_, commit)| now.saturating_sub(commit.created_at_ms()) <= ttl_ms)
            .collect();

        // Each item decides, independently of the others, whether it's
        // something the peer is missing; the filter and counters are then
        // folded in afterwards in scan order (spec §5: "the order of
        // commits added to the local filter equals the order yielded by
        // the iterator").
        let decisions = Scheduler::map(
            items,
            |(id, commit)| async move {
                let is_missing = want_missing
                    && match peer_filter {
                        Some(pf) => !pf.has(&id),
                        None => false,
                    };
                Ok((id, is_missing.then_some(commit)))
            },
            Priority::Normal,
            "build_outbound_filter",
            false,
        )
        .await?;

        let mut missing = Vec::new();
        let mut recounted: u64 = 0;
        for (id, maybe_missing) in decisions {
            filter.add(&id);
            recounted += 1;
            if let Some(commit) = maybe_missing {
                missing.push(commit);
            }
        }

        tracing::debug!(recounted, missing = missing.len(), "scan complete");

        let message = SyncMessage {
            org_id: self.store.org_id().to_owned(),
            build_version: self.build_version,
            filter,
            size: recounted,
            values: missing,
            access_denied: Vec::new(),
        };

        Ok(BuildOutcome {
            message,
            recounted_size: recounted,
        })
    }

    /// Persists an inbound message's values (idempotent on commit ID) and
    /// returns the peer's filter for use in the next outbound build, along
    /// with how many of the peer's values were newly inserted.
    ///
    /// An unknown `build_version` strictly newer than ours is tolerated
    /// (logged as version skew, not an error); nothing about the envelope
    /// beyond the five documented keys is inspected.
    pub async fn process_message(
        &self,
        repo_id: &str,
        message: SyncMessage,
    ) -> anyhow::Result<ProcessOutcome> {
        let span = tracing::info_span!("sync_cycle_process", repo = %repo_id, org = %self.store.org_id());
        let _enter = span.enter();

        if message.build_version > self.build_version {
            self.metrics.record_version_skew();
            tracing::warn!(
                peer_version = message.build_version,
                local_version = self.build_version,
                "peer build version is newer; proceeding (forward-compat)"
            );
        }

        for denied in &message.access_denied {
            tracing::debug!(id = %denied, "peer withheld commit due to auth");
        }

        let values = message.values;
        let store = &self.store;
        let outcomes = Scheduler::map(
            values,
            |commit| async move { store.put_commit(repo_id, commit) },
            Priority::Normal,
            "apply_inbound_values",
            false,
        )
        .await?;
        let inserted = outcomes
            .iter()
            .filter(|o| matches!(o, PutOutcome::Inserted))
            .count() as u64;

        Ok(ProcessOutcome {
            peer_filter: message.filter,
            peer_size: message.size,
            inserted,
            access_denied: message.access_denied,
        })
    }

    /// Runs a timed cycle: builds an outbound message, then feeds the
    /// elapsed time into the pacer so the next interval reflects this
    /// cycle's cost. If `ceiling` is exceeded the cycle is abandoned
    /// (spec §5 "Timeouts"): the caller gets `None` and should fall back
    /// to the last good peer filter while the pacer raises FPR.
    pub async fn timed_build(
        &self,
        repo_id: &str,
        peer_filter: Option<&BloomFilter>,
        local_size: u64,
        peer_size: u64,
        ceiling: Duration,
    ) -> anyhow::Result<Option<BuildOutcome>> {
        let started = Instant::now();
        let outcome = self
            .build_message(repo_id, peer_filter, local_size, peer_size)
            .await?;
        let elapsed = started.elapsed();
        self.pacer.record_cycle_latency(elapsed);
        if elapsed > ceiling {
            tracing::warn!(?elapsed, ?ceiling, "cycle exceeded ceiling, abandoning");
            return Ok(None);
        }
        Ok(Some(outcome))
    }
}

/// Result of applying an inbound message.
pub struct ProcessOutcome {
    /// The peer's filter, to be fed into the next outbound build.
    pub peer_filter: BloomFilter,
    /// The peer's declared cardinality at send time.
    pub peer_size: u64,
    /// How many of the peer's values were newly inserted (not duplicates).
    pub inserted: u64,
    /// IDs the peer withheld from us due to its own auth rules.
    pub access_denied: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fpr_shrinks_as_cardinality_grows() {
        let small = adaptive_fpr(10, 10, 3, false);
        let large = adaptive_fpr(100_000, 100_000, 3, false);
        assert!(large < small);
        assert!(small <= 0.5 && large > 0.0);
    }

    #[test]
    fn low_accuracy_forces_half() {
        assert_eq!(adaptive_fpr(100_000, 5, 3, true), 0.5);
    }

    #[test]
    fn more_expected_cycles_relaxes_fpr() {
        let strict = adaptive_fpr(1000, 1000, 1, false);
        let relaxed = adaptive_fpr(1000, 1000, 10, false);
        assert!(relaxed > strict);
    }

    #[test]
    fn pacer_slows_down_under_load() {
        let pacer = Pacer::new(Duration::from_millis(100), Duration::from_secs(30));
        let idle = pacer.next_interval();
        pacer.record_cycle_latency(Duration::from_secs(5));
        pacer.record_activity(10_000);
        let busy = pacer.next_interval();
        assert!(busy > idle);
    }
}
