use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// The literal schema marker used by objects that predate any schema.
pub const NULL_MARKER: &str = "null";

/// Wall-clock milliseconds since the Unix epoch, for stamping a commit's
/// `created_at_ms` at construction time. Clamped to `0` on a clock before
/// the epoch rather than panicking.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An immutable, content-addressed record.
///
/// A commit is never rewritten once constructed: every field is set at
/// construction time and there is no setter. Equality and hashing are by
/// `id` alone, since `id` is defined to be stable and globally unique
/// within an organization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commit {
    id: String,
    schema_marker: String,
    payload: Map<String, Value>,
    created_at_ms: u64,
}

impl Commit {
    /// Creates a new commit. `schema_marker` should be `"null"` or of the
    /// form `"<ns>/<version>"`; malformed markers are accepted here and
    /// only rejected when the registry is asked to decode them.
    /// `created_at_ms` anchors the TTL window (spec §3/§6: "window of
    /// commits considered for sync"); callers that don't care about a
    /// specific value can pass [`now_ms`].
    pub fn new(
        id: impl Into<String>,
        schema_marker: impl Into<String>,
        payload: Map<String, Value>,
        created_at_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            schema_marker: schema_marker.into(),
            payload,
            created_at_ms,
        }
    }

    /// Stable globally-unique identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The raw schema marker string, as stored.
    pub fn schema_marker(&self) -> &str {
        &self.schema_marker
    }

    /// The opaque payload.
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Milliseconds since the Unix epoch this commit was constructed at.
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Replaces the payload and marker, returning a new commit with the same
    /// `id` and `created_at_ms`. Used by the schema registry to surface an
    /// upgraded copy without mutating the original (spec: "the original
    /// commit is untouched").
    pub fn with_upgrade(&self, schema_marker: String, payload: Map<String, Value>) -> Self {
        Self {
            id: self.id.clone(),
            schema_marker,
            payload,
            created_at_ms: self.created_at_ms,
        }
    }
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Commit {}

impl std::hash::Hash for Commit {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
