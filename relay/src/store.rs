use ledgersync_core::{Commit, CommitStore, PutOutcome};
use std::sync::Arc;

/// A [`CommitStore`] backed by a [`sled::Tree`], one tree per org.
///
/// Keys are `"{repo_id}/{commit_id}"`, which makes `scan` a cheap
/// prefix iteration and keeps repos within an org from colliding.
pub struct SledCommitStore {
    tree: sled::Tree,
    org_id: Arc<str>,
}

impl SledCommitStore {
    /// Opens `org_id`'s tree in `db`.
    pub fn open(db: &sled::Db, org_id: impl Into<Arc<str>>) -> anyhow::Result<Self> {
        let org_id = org_id.into();
        let tree = db.open_tree(org_id.as_bytes())?;
        Ok(Self { tree, org_id })
    }

    fn key(&self, repo_id: &str, commit_id: &str) -> Vec<u8> {
        format!("{}/{}", repo_id, commit_id).into_bytes()
    }
}

/// Iterator adapter over a prefix scan, parsing each value back into a
/// [`Commit`] and skipping the repo-id prefix back off each key.
pub struct SledIter {
    prefix_len: usize,
    inner: sled::Iter,
}

impl Iterator for SledIter {
    type Item = anyhow::Result<(String, Commit)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = match self.inner.next()? {
            Ok(pair) => pair,
            Err(err) => return Some(Err(err.into())),
        };
        let id = String::from_utf8_lossy(&key[self.prefix_len..]).into_owned();
        let parsed: anyhow::Result<Commit> =
            serde_json::from_slice(&value).map_err(anyhow::Error::from);
        Some(parsed.map(|commit| (id, commit)))
    }
}

impl CommitStore for SledCommitStore {
    type Iter = SledIter;

    fn scan(&self, repo_id: &str) -> anyhow::Result<Self::Iter> {
        let prefix = format!("{}/", repo_id);
        Ok(SledIter {
            prefix_len: prefix.len(),
            inner: self.tree.scan_prefix(prefix),
        })
    }

    fn has_commit(&self, repo_id: &str, id: &str) -> anyhow::Result<bool> {
        Ok(self.tree.contains_key(self.key(repo_id, id))?)
    }

    fn put_commit(&self, repo_id: &str, commit: Commit) -> anyhow::Result<PutOutcome> {
        let key = self.key(repo_id, commit.id());
        if self.tree.contains_key(&key)? {
            return Ok(PutOutcome::Duplicate);
        }
        let bytes = serde_json::to_vec(&commit)?;
        self.tree.insert(key, bytes)?;
        Ok(PutOutcome::Inserted)
    }

    fn org_id(&self) -> &str {
        &self.org_id
    }
}
