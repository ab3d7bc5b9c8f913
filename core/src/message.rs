use crate::bloom::BloomFilter;
use crate::commit::Commit;
use crate::error::{Metrics, SyncError};
use crate::scheduler::{Priority, Scheduler};
use serde::ser::SerializeMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// One symmetric exchange unit of the sync protocol (spec §3/§4.3).
///
/// `org_id` scopes the exchange but, per the documented wire layout, is not
/// part of the serialized envelope — see `SPEC_FULL.md` §3 for why.
#[derive(Debug, Clone)]
pub struct SyncMessage {
    /// Scope of the exchange.
    pub org_id: String,
    /// Sender's protocol version.
    pub build_version: u32,
    /// Sender's bloom filter over its collection.
    pub filter: BloomFilter,
    /// Sender's collection cardinality at send time.
    pub size: u64,
    /// Commits the sender suspects the peer lacks.
    pub values: Vec<Commit>,
    /// IDs the sender refused to ship due to auth.
    pub access_denied: Vec<String>,
}

mod keys {
    pub const VER: &str = "ver";
    pub const FILTER: &str = "f";
    pub const SIZE: &str = "s";
    pub const COMMITS: &str = "c";
    pub const ACCESS_DENIED: &str = "ad";
}

impl Serialize for SyncMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(5))?;
        map.serialize_entry(keys::VER, &self.build_version)?;
        map.serialize_entry(keys::FILTER, &self.filter)?;
        map.serialize_entry(keys::SIZE, &self.size)?;
        map.serialize_entry(keys::COMMITS, &self.values)?;
        map.serialize_entry(keys::ACCESS_DENIED, &self.access_denied)?;
        map.end()
    }
}

impl SyncMessage {
    /// Serializes to the wire format. Byte-level reproducibility across
    /// implementations isn't required (spec §6); this is plain JSON.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Tolerant decode: the filter and `ver`/`s` must be present and valid
    /// or the whole message fails (`DecodeFilterFailure` territory, left to
    /// the caller to log and abandon the cycle). Individual bad entries in
    /// `c` are skipped rather than poisoning the batch (spec §4.3/§7);
    /// `c`/`ad` default to empty when absent. `org_id` isn't carried on the
    /// wire, so the caller supplies the org scope the channel implies.
    ///
    /// Commits are decoded through [`Scheduler::map`], yielding to the
    /// caller's executor between constructions rather than decoding the
    /// whole batch in one synchronous sweep (spec §4.3/§5, suspension
    /// point (a): "a decode of commits").
    pub async fn from_bytes(bytes: &[u8], org_id: impl Into<String>, metrics: &Metrics) -> anyhow::Result<Self> {
        let root: Value = serde_json::from_slice(bytes)?;
        let obj = root
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("sync message envelope must be a JSON object"))?;

        let build_version = obj
            .get(keys::VER)
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("missing or invalid {:?}", keys::VER))? as u32;

        let filter_value = obj
            .get(keys::FILTER)
            .ok_or_else(|| anyhow::anyhow!("missing {:?}", keys::FILTER))?;
        let filter: BloomFilter = serde_json::from_value(filter_value.clone()).map_err(|err| {
            metrics.record_decode_filter_failure();
            SyncError::DecodeFilterFailure(err.to_string())
        })?;

        let size = obj.get(keys::SIZE).and_then(Value::as_u64).unwrap_or(0);

        let raw_commits: Vec<Value> = match obj.get(keys::COMMITS) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };

        let decoded = Scheduler::map(
            raw_commits,
            |item| async move { Ok(serde_json::from_value::<Commit>(item)) },
            Priority::Normal,
            "decode_commits",
            false,
        )
        .await?;

        let mut values = Vec::with_capacity(decoded.len());
        for outcome in decoded {
            match outcome {
                Ok(commit) => values.push(commit),
                Err(err) => {
                    metrics.record_decode_commit_failure();
                    tracing::warn!(%err, "skipping corrupted commit in sync message");
                }
            }
        }

        let mut access_denied = Vec::new();
        if let Some(Value::Array(items)) = obj.get(keys::ACCESS_DENIED) {
            for item in items {
                if let Some(id) = item.as_str() {
                    access_denied.push(id.to_owned());
                }
            }
        }

        Ok(Self {
            org_id: org_id.into(),
            build_version,
            filter,
            size,
            values,
            access_denied,
        })
    }
}

/// A decode outcome paired with how many bad commits were skipped, for
/// callers (tests, diagnostics) that want the count without reaching into
/// shared [`Metrics`].
pub struct DecodeReport {
    /// The decoded message.
    pub message: SyncMessage,
    /// Commits dropped during decode.
    pub skipped_commits: u64,
}

impl DecodeReport {
    /// Decodes with a private scratch [`Metrics`], returning both the
    /// message and the skip count observed during this call.
    pub async fn decode(bytes: &[u8], org_id: impl Into<String>) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::default());
        let message = SyncMessage::from_bytes(bytes, org_id, &metrics).await?;
        Ok(Self {
            message,
            skipped_commits: metrics.snapshot().decode_commit_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::Commit;
    use futures::executor::block_on;
    use serde_json::{json, Map};

    fn commit(id: &str) -> Commit {
        Commit::new(id, "null", Map::new(), 0)
    }

    #[test]
    fn round_trips_semantically() {
        let mut filter = BloomFilter::new(10, 0.1);
        filter.add("a");
        let msg = SyncMessage {
            org_id: "org-1".into(),
            build_version: 7,
            filter,
            size: 1,
            values: vec![commit("a")],
            access_denied: vec!["z".into()],
        };
        let bytes = msg.to_bytes().unwrap();
        let metrics = Metrics::default();
        let decoded = block_on(SyncMessage::from_bytes(&bytes, "org-1", &metrics)).unwrap();
        assert_eq!(decoded.build_version, msg.build_version);
        assert_eq!(decoded.size, msg.size);
        assert_eq!(decoded.access_denied, msg.access_denied);
        assert_eq!(decoded.values.len(), 1);
        assert_eq!(decoded.values[0].id(), "a");
        assert_eq!(decoded.filter.has("a"), msg.filter.has("a"));
    }

    #[test]
    fn tolerates_one_corrupted_commit() {
        let mut filter = BloomFilter::new(10, 0.1);
        filter.add("ok");
        let mut envelope = serde_json::to_value(&SyncMessage {
            org_id: "org-1".into(),
            build_version: 1,
            filter,
            size: 2,
            values: vec![],
            access_denied: vec![],
        })
        .unwrap();
        // Inject a mix of one good and one malformed commit by hand,
        // simulating the "commit #42 is corrupted" scenario from spec §8.
        let good = serde_json::to_value(commit("ok")).unwrap();
        let bad = json!({"id": 42, "not_a_commit": true});
        envelope["c"] = json!([good, bad]);

        let bytes = serde_json::to_vec(&envelope).unwrap();
        let report = block_on(DecodeReport::decode(&bytes, "org-1")).unwrap();
        assert_eq!(report.message.values.len(), 1);
        assert_eq!(report.skipped_commits, 1);
    }

    #[test]
    fn absent_commits_and_denials_default_empty() {
        let filter = BloomFilter::new(5, 0.2);
        let mut envelope = serde_json::to_value(&SyncMessage {
            org_id: "org-1".into(),
            build_version: 1,
            filter,
            size: 0,
            values: vec![],
            access_denied: vec![],
        })
        .unwrap();
        envelope.as_object_mut().unwrap().remove("c");
        envelope.as_object_mut().unwrap().remove("ad");
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let metrics = Metrics::default();
        let decoded = block_on(SyncMessage::from_bytes(&bytes, "org-1", &metrics)).unwrap();
        assert!(decoded.values.is_empty());
        assert!(decoded.access_denied.is_empty());
    }

    #[test]
    fn malformed_filter_fails_closed_and_counts() {
        let mut envelope = serde_json::to_value(&SyncMessage {
            org_id: "org-1".into(),
            build_version: 1,
            filter: BloomFilter::new(5, 0.2),
            size: 0,
            values: vec![],
            access_denied: vec![],
        })
        .unwrap();
        envelope["f"] = json!("not a filter");
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let metrics = Metrics::default();
        let err = block_on(SyncMessage::from_bytes(&bytes, "org-1", &metrics)).unwrap_err();
        assert!(err.downcast_ref::<SyncError>().is_some());
        assert_eq!(metrics.snapshot().decode_filter_failures, 1);
    }
}
