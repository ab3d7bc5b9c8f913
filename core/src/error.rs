use std::sync::atomic::{AtomicU64, Ordering};

/// Recoverable-vs-fatal error kinds from spec §7.
///
/// Variants that are recoverable at the engine level (everything except
/// [`SyncError::RuleRegistrationConflict`]) are never returned from a
/// cycle; they're counted on [`Metrics`] and logged. `RuleRegistrationConflict`
/// is the one kind callers see as a hard `Err`, since it's a programmer
/// error at registration time, not a runtime condition.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    /// A single commit in an inbound message failed to decode.
    #[error("commit decode failure: {0}")]
    DecodeCommitFailure(String),
    /// The bloom filter in an inbound message failed to decode; the cycle
    /// is abandoned.
    #[error("filter decode failure: {0}")]
    DecodeFilterFailure(String),
    /// An upgrade chain is missing an intermediate version.
    #[error("upgrade chain missing version {ns}/{version}")]
    UpgradeMissingVersion {
        /// Namespace of the broken chain.
        ns: String,
        /// First missing version.
        version: u32,
    },
    /// A schema marker names an (ns, version) the registry doesn't know.
    #[error("unknown schema marker: {0}")]
    UnknownSchemaMarker(String),
    /// Registering a rule at a path that already has one.
    #[error("a rule is already registered for path {0:?}")]
    RuleRegistrationConflict(String),
}

/// Process counters for conditions that degrade gracefully instead of
/// aborting a cycle. Mirrors the "reported via a metric counter" language
/// in spec §7; cheap to share across threads since every field is atomic.
#[derive(Default)]
pub struct Metrics {
    decode_commit_failures: AtomicU64,
    decode_filter_failures: AtomicU64,
    upgrade_missing_version: AtomicU64,
    unknown_schema_marker: AtomicU64,
    access_denied: AtomicU64,
    version_skew: AtomicU64,
}

/// Point-in-time counter values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Count of skipped per-commit decode failures.
    pub decode_commit_failures: u64,
    /// Count of abandoned cycles due to a bad filter.
    pub decode_filter_failures: u64,
    /// Count of upgrade attempts that hit a missing intermediate version.
    pub upgrade_missing_version: u64,
    /// Count of reads that fell back to the null schema.
    pub unknown_schema_marker: u64,
    /// Count of IDs withheld from outbound messages by auth.
    pub access_denied: u64,
    /// Count of peers observed with a skewed `buildVersion`.
    pub version_skew: u64,
}

impl Metrics {
    /// Records a skipped, corrupted commit.
    pub fn record_decode_commit_failure(&self) {
        self.decode_commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an abandoned cycle due to a filter decode failure.
    pub fn record_decode_filter_failure(&self) {
        self.decode_filter_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed upgrade attempt.
    pub fn record_upgrade_missing_version(&self) {
        self.upgrade_missing_version.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a marker that decoded to no known schema.
    pub fn record_unknown_schema_marker(&self) {
        self.unknown_schema_marker.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an ID withheld from an outbound message by auth.
    pub fn record_access_denied(&self) {
        self.access_denied.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a peer with a newer-than-local `buildVersion`.
    pub fn record_version_skew(&self) {
        self.version_skew.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters at once.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            decode_commit_failures: self.decode_commit_failures.load(Ordering::Relaxed),
            decode_filter_failures: self.decode_filter_failures.load(Ordering::Relaxed),
            upgrade_missing_version: self.upgrade_missing_version.load(Ordering::Relaxed),
            unknown_schema_marker: self.unknown_schema_marker.load(Ordering::Relaxed),
            access_denied: self.access_denied.load(Ordering::Relaxed),
            version_skew: self.version_skew.load(Ordering::Relaxed),
        }
    }
}
