//! # ledgersync
//!
//! Facade wiring [`ledgersync_core`]'s bloom-filter sync engine and schema
//! registry together with [`ledgersync_auth`]'s path-pattern matcher into a
//! single [`Peer`] — the anti-entropy synchronization core for a
//! peer-to-peer, append-only replicated commit store.
//!
//! The facade owns nothing the two crates don't already provide; it exists
//! so that transporting a message outward gates on `read` access the way
//! accepting one inward gates on `write` access, in one place, instead of
//! being left to every caller to wire up the same way (spec §1: "sync
//! messages transport commits that belong to repositories, the registry
//! decides whether each transported payload is understood, and
//! authorization gates both what is shipped outward and what is accepted
//! inward").
#![warn(missing_docs)]
use ledgersync_auth::{AuthMatcher, Op, Pattern, RulePredicate, Session};
use ledgersync_core::{
    BuildOutcome, Commit, CommitStore, Config, Metrics, ProcessOutcome, Schema, SchemaRegistry,
    SyncEngine, SyncMessage,
};
use serde_json::{Map, Value};
use std::any::Any;
use std::sync::Arc;

pub use ledgersync_auth as auth;
pub use ledgersync_core as core;

/// One side of a sync relationship: a store, a schema registry, and an
/// auth matcher wired together behind one build version.
pub struct Peer<S> {
    engine: SyncEngine<S>,
    schema: Arc<SchemaRegistry>,
    auth: Arc<AuthMatcher>,
    metrics: Arc<Metrics>,
}

impl<S: CommitStore> Peer<S> {
    /// Opens a peer over `store`, with fresh schema/auth registries and a
    /// shared metrics handle.
    pub fn new(store: S, config: Config, build_version: u32) -> Self {
        let metrics = Arc::new(Metrics::default());
        let schema = Arc::new(SchemaRegistry::new(metrics.clone()));
        let auth = Arc::new(AuthMatcher::new());
        let engine = SyncEngine::new(store, config, build_version, metrics.clone());
        Self {
            engine,
            schema,
            auth,
            metrics,
        }
    }

    /// The schema registry this peer reads commits through.
    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// The authorization matcher gating this peer's inbound/outbound flow.
    pub fn auth(&self) -> &Arc<AuthMatcher> {
        &self.auth
    }

    /// Shared recoverable-condition counters.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Registers a user auth rule.
    pub fn register_rule(&self, pattern: Pattern, predicate: RulePredicate) -> anyhow::Result<()> {
        self.auth.register_rule(pattern, predicate)
    }

    /// Reads a commit through the schema registry, upgrading its payload
    /// to the latest version of its namespace. An unrecognized marker
    /// reads as the null schema; a chain with a missing intermediate
    /// version surfaces the commit unchanged at its original schema
    /// instead of failing the read (spec §7, §8 scenarios 3-4).
    pub fn read(&self, commit: &Commit) -> (Map<String, Value>, Arc<Schema>) {
        let from = self.schema.decode_or_null(commit.schema_marker());
        match self.schema.upgrade(commit.payload(), &from, None) {
            Some((data, schema)) => (data, schema),
            None => (commit.payload().clone(), from),
        }
    }

    /// Builds an outbound message for `repo_path`, then drops any commit
    /// `session` isn't authorized to read, moving its ID to
    /// `access_denied` instead (spec §4.4 algorithm plus the read-side
    /// auth gate from §1).
    pub async fn build_outbound(
        &self,
        repo_path: &str,
        session: &Session,
        peer_filter: Option<&ledgersync_core::BloomFilter>,
        local_size: u64,
        peer_size: u64,
    ) -> anyhow::Result<SyncMessage> {
        let BuildOutcome { mut message, .. } = self
            .engine
            .build_message(repo_path, peer_filter, local_size, peer_size)
            .await?;

        let mut allowed = Vec::with_capacity(message.values.len());
        let mut denied = Vec::new();
        for commit in message.values.drain(..) {
            if self.is_allowed(repo_path, commit.id(), session, Op::Read) {
                allowed.push(commit);
            } else {
                self.metrics.record_access_denied();
                denied.push(commit.id().to_owned());
            }
        }
        message.values = allowed;
        message.access_denied = denied;
        Ok(message)
    }

    /// Applies an inbound message, dropping any commit `session` isn't
    /// authorized to write before it ever reaches the store (spec §1's
    /// write-side auth gate).
    pub async fn process_inbound(
        &self,
        repo_path: &str,
        session: &Session,
        mut message: SyncMessage,
    ) -> anyhow::Result<ProcessOutcome> {
        let mut allowed = Vec::with_capacity(message.values.len());
        for commit in message.values.drain(..) {
            if self.is_allowed(repo_path, commit.id(), session, Op::Write) {
                allowed.push(commit);
            } else {
                self.metrics.record_access_denied();
            }
        }
        message.values = allowed;
        self.engine.process_message(repo_path, message).await
    }

    fn is_allowed(&self, repo_path: &str, item_key: &str, session: &Session, op: Op) -> bool {
        self.auth.is_allowed(&() as &dyn Any, repo_path, item_key, session, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnv::FnvHashMap;
    use futures::executor::block_on;
    use ledgersync_core::{Schema, NULL_MARKER};
    use parking_lot::RwLock as PlRwLock;

    /// An in-memory `CommitStore` for exercising `Peer` without `sled`.
    struct MemoryStore {
        org_id: String,
        repos: PlRwLock<FnvHashMap<String, FnvHashMap<String, Commit>>>,
    }

    impl MemoryStore {
        fn new(org_id: &str) -> Self {
            Self {
                org_id: org_id.to_owned(),
                repos: PlRwLock::new(FnvHashMap::default()),
            }
        }
    }

    impl CommitStore for MemoryStore {
        type Iter = std::vec::IntoIter<anyhow::Result<(String, Commit)>>;

        fn scan(&self, repo_id: &str) -> anyhow::Result<Self::Iter> {
            let repos = self.repos.read();
            let items: Vec<_> = repos
                .get(repo_id)
                .map(|items| {
                    items
                        .iter()
                        .map(|(id, commit)| Ok((id.clone(), commit.clone())))
                        .collect()
                })
                .unwrap_or_default();
            Ok(items.into_iter())
        }

        fn has_commit(&self, repo_id: &str, id: &str) -> anyhow::Result<bool> {
            Ok(self
                .repos
                .read()
                .get(repo_id)
                .map(|items| items.contains_key(id))
                .unwrap_or(false))
        }

        fn put_commit(
            &self,
            repo_id: &str,
            commit: Commit,
        ) -> anyhow::Result<ledgersync_core::PutOutcome> {
            let mut repos = self.repos.write();
            let repo = repos.entry(repo_id.to_owned()).or_default();
            if repo.contains_key(commit.id()) {
                return Ok(ledgersync_core::PutOutcome::Duplicate);
            }
            repo.insert(commit.id().to_owned(), commit);
            Ok(ledgersync_core::PutOutcome::Inserted)
        }

        fn org_id(&self) -> &str {
            &self.org_id
        }
    }

    fn peer() -> Peer<MemoryStore> {
        Peer::new(MemoryStore::new("org-test"), Config::default(), 1)
    }

    fn seed(peer: &Peer<MemoryStore>, repo: &str, ids: &[&str]) {
        let message = SyncMessage {
            org_id: "org-test".to_owned(),
            build_version: 1,
            filter: ledgersync_core::BloomFilter::new(1, 0.5),
            size: 0,
            values: ids
                .iter()
                .map(|id| Commit::new(*id, NULL_MARKER, Map::new(), ledgersync_core::now_ms()))
                .collect(),
            access_denied: Vec::new(),
        };
        block_on(peer.process_inbound(repo, &Session::new("root"), message)).unwrap();
    }

    #[test]
    fn build_outbound_withholds_denied_commits() {
        let peer = peer();
        seed(&peer, "/teams/x", &["public", "secret"]);
        peer.register_rule(
            Pattern::Exact("/teams/x".to_owned()),
            Arc::new(|_db, _repo, item_key, _session, _op| item_key != "secret"),
        )
        .unwrap();

        // An empty peer filter stands in for "peer has nothing yet" — with
        // no peer filter at all, `build_outbound` sends the local filter
        // only and accumulates no missing values (spec §4.4 step 2).
        let empty_peer_filter = ledgersync_core::BloomFilter::new(1, 0.5);
        let session = Session::new("alice");
        let message = block_on(peer.build_outbound(
            "/teams/x",
            &session,
            Some(&empty_peer_filter),
            0,
            0,
        ))
        .unwrap();
        let ids: Vec<&str> = message.values.iter().map(Commit::id).collect();
        assert!(ids.contains(&"public"));
        assert!(!ids.contains(&"secret"));
        assert_eq!(message.access_denied, vec!["secret".to_owned()]);
    }

    #[test]
    fn process_inbound_drops_writes_session_cannot_make() {
        let peer = peer();
        peer.register_rule(
            Pattern::Exact("/teams/locked".to_owned()),
            Arc::new(|_db, _repo, _item_key, session, op| match op {
                Op::Read => true,
                Op::Write => session.is_root(),
            }),
        )
        .unwrap();

        let alice = Session::new("alice");
        let message = SyncMessage {
            org_id: "org-test".to_owned(),
            build_version: 1,
            filter: ledgersync_core::BloomFilter::new(1, 0.5),
            size: 0,
            values: vec![Commit::new("blocked", NULL_MARKER, Map::new(), ledgersync_core::now_ms())],
            access_denied: Vec::new(),
        };
        let outcome = block_on(peer.process_inbound("/teams/locked", &alice, message)).unwrap();
        assert_eq!(outcome.inserted, 0);
    }

    #[test]
    fn read_upgrades_payload_to_latest_registered_version() {
        let peer = peer();
        peer.schema()
            .register(Schema::new("User", 1, None))
            .unwrap();
        let upgrade: ledgersync_core::Upgrader = Arc::new(|data: &Map<String, Value>| {
            let mut next = data.clone();
            next.insert("migrated".to_owned(), Value::Bool(true));
            next
        });
        peer.schema()
            .register(Schema::new("User", 2, Some(upgrade)))
            .unwrap();

        let commit = Commit::new("u1", "User/1", Map::new(), ledgersync_core::now_ms());
        let (data, schema) = peer.read(&commit);
        assert_eq!(schema.version(), 2);
        assert_eq!(data.get("migrated"), Some(&Value::Bool(true)));
    }
}
