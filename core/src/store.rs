use crate::commit::Commit;

/// Outcome of inserting a commit (spec §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PutOutcome {
    /// The commit was new to this repo.
    Inserted,
    /// A commit with this ID already existed; the store is unchanged.
    Duplicate,
}

/// The external collaborator the sync engine pulls from and pushes into.
/// Everything about the on-disk representation is opaque to the core
/// (spec §1): the engine only scans, checks, and inserts.
pub trait CommitStore {
    /// Iterator error type; boxed so implementations can wrap whatever
    /// storage error they have without the trait depending on it.
    type Iter: Iterator<Item = anyhow::Result<(String, Commit)>>;

    /// Lazily iterates every `(id, commit)` pair held for `repo_id`. Must
    /// be cheap to construct repeatedly — the engine builds a fresh one
    /// per cycle.
    fn scan(&self, repo_id: &str) -> anyhow::Result<Self::Iter>;

    /// `true` if a commit with `id` is already stored for `repo_id`.
    fn has_commit(&self, repo_id: &str, id: &str) -> anyhow::Result<bool>;

    /// Inserts a commit, idempotent on ID.
    fn put_commit(&self, repo_id: &str, commit: Commit) -> anyhow::Result<PutOutcome>;

    /// Tenant identifier scoping this store.
    fn org_id(&self) -> &str;
}
