use crate::error::{Metrics, SyncError};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A pure function from one version's data to the next.
pub type Upgrader = Arc<dyn Fn(&Map<String, Value>) -> Map<String, Value> + Send + Sync>;

/// A single registered schema version.
///
/// `ns = None` identifies the universal null schema, which has no
/// versions beyond itself and no upgrader.
#[derive(Clone)]
pub struct Schema {
    ns: Option<String>,
    version: u32,
    upgrade: Option<Upgrader>,
}

impl Schema {
    /// Creates a versioned schema entry for a namespace.
    pub fn new(ns: impl Into<String>, version: u32, upgrade: Option<Upgrader>) -> Self {
        Self {
            ns: Some(ns.into()),
            version,
            upgrade,
        }
    }

    /// The universal empty schema.
    pub fn null() -> Self {
        Self {
            ns: None,
            version: 0,
            upgrade: None,
        }
    }

    /// Namespace, or `None` for the null schema.
    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    /// Monotonic version within `ns`. Meaningless for the null schema.
    pub fn version(&self) -> u32 {
        self.version
    }

    fn is_null(&self) -> bool {
        self.ns.is_none()
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("ns", &self.ns)
            .field("version", &self.version)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.ns == other.ns && self.version == other.version
    }
}

struct Namespace {
    versions: BTreeMap<u32, Arc<Schema>>,
}

impl Namespace {
    fn new() -> Self {
        Self {
            versions: BTreeMap::new(),
        }
    }

    /// `true` if versions 1..=latest are all present with no gaps.
    fn is_dense(&self) -> bool {
        self.versions
            .keys()
            .copied()
            .eq(1..=self.versions.len() as u32)
    }
}

/// Maps `(ns, version)` to schemas and drives the upgrade chain.
///
/// Read-mostly after startup: registration takes a write lock, every other
/// operation only reads. The built-in namespaces `Session`, `User`, and
/// `UserStats` are present from construction (spec §3).
pub struct SchemaRegistry {
    namespaces: RwLock<BTreeMap<String, Namespace>>,
    metrics: Arc<Metrics>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new(Arc::new(Metrics::default()))
    }
}

impl SchemaRegistry {
    /// Creates a registry with the built-in namespaces pre-registered at
    /// version 1, sharing `metrics` with whatever sync engine owns it.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let registry = Self {
            namespaces: RwLock::new(BTreeMap::new()),
            metrics,
        };
        for ns in ["Session", "User", "UserStats"] {
            registry
                .register(Schema::new(ns, 1, None))
                .expect("builtin namespaces start dense");
        }
        registry
    }

    /// Inserts a schema into its namespace's version chain. Idempotent on
    /// `(ns, version)`: registering the same pair again just replaces the
    /// entry. The null schema is always implicitly present and can't be
    /// registered. Fails fast with [`SyncError::UpgradeMissingVersion`] if
    /// the insertion leaves the namespace's chain with a gap, rather than
    /// waiting to discover it during an upgrade.
    pub fn register(&self, schema: Schema) -> anyhow::Result<()> {
        if schema.is_null() {
            return Ok(());
        }
        let ns = schema.ns.clone().unwrap();
        tracing::debug!(ns = %ns, version = schema.version, "registering schema");
        {
            let mut namespaces = self.namespaces.write();
            let entry = namespaces.entry(ns.clone()).or_insert_with(Namespace::new);
            entry.versions.insert(schema.version, Arc::new(schema));
        }
        self.check_dense(&ns)?;
        Ok(())
    }

    /// Looks up a schema. `version = None` returns the latest registered
    /// version for `ns`. `ns = None` always returns the null schema.
    pub fn get(&self, ns: Option<&str>, version: Option<u32>) -> Option<Arc<Schema>> {
        let ns = ns?;
        let namespaces = self.namespaces.read();
        let entry = namespaces.get(ns)?;
        match version {
            Some(v) => entry.versions.get(&v).cloned(),
            None => entry.versions.values().next_back().cloned(),
        }
    }

    /// Registered versions for `ns`, ascending.
    pub fn describe(&self, ns: &str) -> Vec<u32> {
        self.namespaces
            .read()
            .get(ns)
            .map(|n| n.versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Walks the upgrade chain from `from.version + 1` through
    /// `target.version` (or the latest registered version of `from`'s
    /// namespace if `target` is omitted), applying each step's upgrader in
    /// turn. `data` is cloned before any mutation, so a chain that fails
    /// partway never touches the caller's copy.
    ///
    /// Returns `None` if any intermediate version is missing from the
    /// registry (spec: dense-chain invariant violated) or if `from`'s
    /// namespace has no registered versions when a version-qualified
    /// `target` isn't given.
    pub fn upgrade(
        &self,
        data: &Map<String, Value>,
        from: &Schema,
        target: Option<&Schema>,
    ) -> Option<(Map<String, Value>, Arc<Schema>)> {
        if from.is_null() && target.is_none() {
            return Some((data.clone(), Arc::new(Schema::null())));
        }
        let ns = from.ns.clone()?;
        let target = match target {
            Some(t) => Arc::new(t.clone()),
            None => self.get(Some(&ns), None)?,
        };
        if target.version == from.version {
            return Some((data.clone(), target));
        }
        let mut current = data.clone();
        for version in (from.version + 1)..=target.version {
            match self.get(Some(&ns), Some(version)) {
                Some(step) => {
                    if let Some(upgrader) = &step.upgrade {
                        current = upgrader(&current);
                    }
                }
                None => {
                    self.metrics.record_upgrade_missing_version();
                    tracing::warn!(ns = %ns, version, "upgrade chain missing version");
                    return None;
                }
            }
        }
        Some((current, target))
    }

    /// `"null"` for the null schema, else `"<ns>/<version>"`.
    pub fn encode(schema: &Schema) -> String {
        match &schema.ns {
            None => crate::commit::NULL_MARKER.to_owned(),
            Some(ns) => format!("{}/{}", ns, schema.version),
        }
    }

    /// Inverse of [`Self::encode`]. Unknown `(ns, version)` yields `None`.
    /// Malformed markers are treated as unknown and bump the
    /// `unknown_schema_marker` metric rather than erroring, per spec §7:
    /// objects with an unrecognized marker read as the null schema.
    pub fn decode(&self, marker: &str) -> Option<Arc<Schema>> {
        if marker == crate::commit::NULL_MARKER {
            return Some(Arc::new(Schema::null()));
        }
        let (ns, version) = marker.split_once('/')?;
        let version: u32 = version.parse().ok()?;
        let found = self.get(Some(ns), Some(version));
        if found.is_none() {
            self.metrics.record_unknown_schema_marker();
        }
        found
    }

    /// Treats an unrecognized marker as the null schema instead of
    /// returning `None`, matching the `UnknownSchemaMarker` policy of
    /// spec §7 ("treated as the null schema on read").
    pub fn decode_or_null(&self, marker: &str) -> Arc<Schema> {
        self.decode(marker).unwrap_or_else(|| Arc::new(Schema::null()))
    }

    /// Validates that registering `schema` wouldn't leave its namespace with
    /// a gap, surfaced for callers that want to fail fast instead of
    /// discovering the gap during an upgrade.
    pub fn check_dense(&self, ns: &str) -> Result<(), SyncError> {
        let namespaces = self.namespaces.read();
        match namespaces.get(ns) {
            Some(entry) if !entry.is_dense() => Err(SyncError::UpgradeMissingVersion {
                ns: ns.to_owned(),
                version: entry
                    .versions
                    .keys()
                    .copied()
                    .enumerate()
                    .find(|(i, v)| *v != (*i as u32 + 1))
                    .map(|(i, _)| i as u32 + 1)
                    .unwrap_or(1),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bump(field: &'static str) -> Upgrader {
        Arc::new(move |data: &Map<String, Value>| {
            let mut next = data.clone();
            next.insert(field.to_owned(), Value::Bool(true));
            next
        })
    }

    #[test]
    fn builtin_namespaces_present() {
        let reg = SchemaRegistry::default();
        for ns in ["Session", "User", "UserStats"] {
            assert_eq!(reg.describe(ns), vec![1]);
        }
    }

    #[test]
    fn full_chain_upgrades() {
        let reg = SchemaRegistry::default();
        reg.register(Schema::new("User", 1, None)).unwrap();
        reg.register(Schema::new("User", 2, Some(bump("v2")))).unwrap();
        reg.register(Schema::new("User", 3, Some(bump("v3")))).unwrap();

        let v1 = reg.get(Some("User"), Some(1)).unwrap();
        let data = json!({"name": "ada"}).as_object().unwrap().clone();
        let (upgraded, schema) = reg.upgrade(&data, &v1, None).unwrap();
        assert_eq!(schema.version(), 3);
        assert_eq!(upgraded.get("v2"), Some(&Value::Bool(true)));
        assert_eq!(upgraded.get("v3"), Some(&Value::Bool(true)));
        // original untouched
        assert!(data.get("v2").is_none());
    }

    #[test]
    fn missing_intermediate_version_rejected_at_registration() {
        let reg = SchemaRegistry::default();
        reg.register(Schema::new("User", 1, None)).unwrap();
        assert!(reg.register(Schema::new("User", 3, None)).is_err());
    }

    #[test]
    fn check_dense_allows_gap_free_chain() {
        let reg = SchemaRegistry::default();
        reg.register(Schema::new("User", 1, None)).unwrap();
        reg.register(Schema::new("User", 2, None)).unwrap();
        assert!(reg.check_dense("User").is_ok());
    }

    #[test]
    fn null_schema_roundtrips() {
        let reg = SchemaRegistry::default();
        assert_eq!(SchemaRegistry::encode(&Schema::null()), "null");
        let decoded = reg.decode("null").unwrap();
        assert!(decoded.is_null());
    }

    #[test]
    fn encode_decode_roundtrip_for_registered() {
        let reg = SchemaRegistry::default();
        reg.register(Schema::new("User", 2, None)).unwrap();
        let schema = reg.get(Some("User"), Some(2)).unwrap();
        let marker = SchemaRegistry::encode(&schema);
        assert_eq!(marker, "User/2");
        let decoded = reg.decode(&marker).unwrap();
        assert_eq!(*decoded, *schema);
    }

    #[test]
    fn unknown_marker_decodes_to_none_but_reads_as_null() {
        let reg = SchemaRegistry::default();
        assert!(reg.decode("Ghost/9").is_none());
        assert!(reg.decode_or_null("Ghost/9").is_null());
    }
}
