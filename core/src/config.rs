/// Default TTL window: 30 days.
pub const DEFAULT_TTL_MS: u64 = 2_592_000_000;

/// Tunables consumed by the sync engine. Passed explicitly rather than held
/// in a global, so a process can run engines for more than one org side by
/// side without cross-talk.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Window of commits considered for sync, in milliseconds.
    pub ttl_ms: u64,
    /// Target number of round-trips (`C` in the FPR formula) before two
    /// peers' collections are expected to match.
    pub expected_sync_cycles: u32,
    /// Force `fpr = 0.5` to minimize bandwidth when latency is cheap.
    pub low_accuracy: bool,
    /// Whether to attach a missing-values payload to outbound messages.
    pub include_missing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_TTL_MS,
            expected_sync_cycles: 3,
            low_accuracy: false,
            include_missing: true,
        }
    }
}
