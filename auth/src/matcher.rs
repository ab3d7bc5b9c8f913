use crate::session::{Session, ROOT};
use parking_lot::RwLock;
use regex::Regex;
use std::any::Any;
use std::sync::Arc;

/// The operation an access is being checked for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Op {
    /// Reading plaintext.
    Read,
    /// Writing a new value.
    Write,
}

/// A path a rule is registered against.
#[derive(Clone)]
pub enum Pattern {
    /// Matched against the normalized repository-id component exactly.
    Exact(String),
    /// Matched against the raw input path.
    Regex(Regex),
}

impl Pattern {
    fn matches(&self, normalized: &str, raw: &str) -> bool {
        match self {
            Pattern::Exact(p) => p == normalized,
            // `regex::Regex` is immutable and safe to reuse across calls —
            // unlike a stateful engine with a `lastIndex` cursor, there's
            // no match state to reset here.
            Pattern::Regex(re) => re.is_match(raw),
        }
    }

    fn exact_key(&self) -> Option<&str> {
        match self {
            Pattern::Exact(p) => Some(p.as_str()),
            Pattern::Regex(_) => None,
        }
    }
}

/// `(db, repoPath, itemKey, session, op) -> bool`, as spec §6.
///
/// `db` is an opaque context handle: the matcher never inspects it, it's
/// only threaded through for predicates that need to consult something
/// beyond what's already in scope. Downcast it with [`Any::downcast_ref`]
/// if your predicate needs it.
pub type RulePredicate =
    Arc<dyn Fn(&dyn Any, &str, &str, &Session, Op) -> bool + Send + Sync>;

/// A registered path pattern plus the predicate it resolves to.
#[derive(Clone)]
pub struct Rule {
    pattern: Pattern,
    predicate: RulePredicate,
}

impl Rule {
    /// Pairs a pattern with the predicate it should resolve to.
    pub fn new(pattern: Pattern, predicate: RulePredicate) -> Self {
        Self { pattern, predicate }
    }

    /// Evaluates this rule's predicate.
    pub fn check(&self, db: &dyn Any, repo_path: &str, item_key: &str, session: &Session, op: Op) -> bool {
        (self.predicate)(db, repo_path, item_key, session, op)
    }
}

/// Collapses repeated slashes and strips a trailing slash, producing the
/// repository-id component an exact [`Pattern`] is compared against.
pub fn normalize(input_path: &str) -> String {
    let mut out = String::with_capacity(input_path.len());
    let mut last_was_slash = false;
    for ch in input_path.chars() {
        if ch == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(ch);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn builtin_rules() -> Vec<Rule> {
    fn owner_or_root(item_key: &str, session: &Session) -> bool {
        session.is_root() || session.owner() == item_key
    }

    vec![
        // /sys/users: anyone reads; writes need to be the item's owner or root.
        Rule::new(
            Pattern::Exact("/sys/users".to_owned()),
            Arc::new(|_db, _repo, item_key, session, op| match op {
                Op::Read => true,
                Op::Write => owner_or_root(item_key, session),
            }),
        ),
        // /sys/sessions: anyone reads; only root writes.
        Rule::new(
            Pattern::Exact("/sys/sessions".to_owned()),
            Arc::new(|_db, _repo, _item_key, session, op| match op {
                Op::Read => true,
                Op::Write => session.is_root(),
            }),
        ),
        // /sys/stats: root only, both ways.
        Rule::new(
            Pattern::Exact("/sys/stats".to_owned()),
            Arc::new(|_db, _repo, _item_key, session, _op| session.is_root()),
        ),
        // /sys/** catch-all: root only, both ways.
        Rule::new(
            Pattern::Regex(Regex::new(r"^/sys/").unwrap()),
            Arc::new(|_db, _repo, _item_key, session, _op| session.is_root()),
        ),
    ]
}

/// Resolves a path to a [`Rule`]: built-ins first (in the fixed order
/// above), then user rules in registration order. `None` means open
/// access — callers that need closed-by-default must register their own
/// catch-all (spec §4.5).
pub struct AuthMatcher {
    builtins: Vec<Rule>,
    user_rules: RwLock<Vec<Rule>>,
}

impl Default for AuthMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthMatcher {
    /// Creates a matcher with the fixed built-in `/sys/**` rules loaded.
    pub fn new() -> Self {
        Self {
            builtins: builtin_rules(),
            user_rules: RwLock::new(Vec::new()),
        }
    }

    /// Registers a user rule. Fails if an identical exact path is already
    /// registered — a programmer error, not a runtime condition (spec §7,
    /// `RuleRegistrationConflict`). Regex patterns can't conflict with each
    /// other since there's no general way to detect overlap; duplicates
    /// there just both get tried in order.
    pub fn register_rule(&self, pattern: Pattern, predicate: RulePredicate) -> anyhow::Result<()> {
        if let Some(key) = pattern.exact_key() {
            let rules = self.user_rules.read();
            if rules.iter().any(|r| r.pattern.exact_key() == Some(key)) {
                anyhow::bail!("a rule is already registered for path {:?}", key);
            }
        }
        tracing::debug!(pattern = %pattern_debug(&pattern), "registering auth rule");
        self.user_rules.write().push(Rule::new(pattern, predicate));
        Ok(())
    }

    /// Resolves `input_path` to a rule. Linear in the number of rules,
    /// no per-call allocation beyond the one-time `normalize` of the input
    /// (hot path per spec §4.5).
    pub fn rule_for_repo(&self, input_path: &str) -> Option<Rule> {
        let normalized = normalize(input_path);
        for rule in &self.builtins {
            if rule.pattern.matches(&normalized, input_path) {
                return Some(rule.clone());
            }
        }
        let user_rules = self.user_rules.read();
        for rule in user_rules.iter() {
            if rule.pattern.matches(&normalized, input_path) {
                return Some(rule.clone());
            }
        }
        None
    }

    /// Convenience: resolves a rule and evaluates it, defaulting to
    /// `true` (open access) when no rule matches.
    pub fn is_allowed(
        &self,
        db: &dyn Any,
        repo_path: &str,
        item_key: &str,
        session: &Session,
        op: Op,
    ) -> bool {
        match self.rule_for_repo(repo_path) {
            Some(rule) => rule.check(db, repo_path, item_key, session, op),
            None => true,
        }
    }
}

fn pattern_debug(pattern: &Pattern) -> String {
    match pattern {
        Pattern::Exact(p) => p.clone(),
        Pattern::Regex(re) => re.as_str().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(owner: &str) -> Session {
        Session::new(owner)
    }

    #[test]
    fn sys_users_read_open_write_owner_or_root() {
        let matcher = AuthMatcher::new();
        let alice = session("alice");
        let root = session(ROOT);

        assert!(matcher.is_allowed(&(), "/sys/users", "bob", &alice, Op::Read));
        assert!(!matcher.is_allowed(&(), "/sys/users", "bob", &alice, Op::Write));
        assert!(matcher.is_allowed(&(), "/sys/users", "alice", &alice, Op::Write));
        assert!(matcher.is_allowed(&(), "/sys/users", "bob", &root, Op::Write));
    }

    #[test]
    fn sys_catch_all_is_root_only() {
        let matcher = AuthMatcher::new();
        let alice = session("alice");
        let root = session(ROOT);
        assert!(!matcher.is_allowed(&(), "/sys/whatever", "x", &alice, Op::Read));
        assert!(matcher.is_allowed(&(), "/sys/whatever", "x", &root, Op::Read));
    }

    #[test]
    fn builtins_cannot_be_overridden() {
        let matcher = AuthMatcher::new();
        // A user rule at the same exact path is registered but the
        // built-in still wins because built-ins are checked first.
        matcher
            .register_rule(
                Pattern::Exact("/sys/users".to_owned()),
                Arc::new(|_, _, _, _, _| true),
            )
            .unwrap();
        let alice = session("alice");
        assert!(!matcher.is_allowed(&(), "/sys/users", "bob", &alice, Op::Write));
    }

    #[test]
    fn unmatched_path_is_open_by_default() {
        let matcher = AuthMatcher::new();
        let alice = session("alice");
        assert!(matcher.is_allowed(&(), "/teams/acme", "doc-1", &alice, Op::Write));
    }

    #[test]
    fn duplicate_exact_registration_conflicts() {
        let matcher = AuthMatcher::new();
        matcher
            .register_rule(
                Pattern::Exact("/teams/acme".to_owned()),
                Arc::new(|_, _, _, _, _| true),
            )
            .unwrap();
        let err = matcher.register_rule(
            Pattern::Exact("/teams/acme".to_owned()),
            Arc::new(|_, _, _, _, _| false),
        );
        assert!(err.is_err());
    }

    #[test]
    fn normalize_collapses_slashes_and_trailing_slash() {
        assert_eq!(normalize("/sys//users/"), "/sys/users");
        assert_eq!(normalize("/sys/users"), "/sys/users");
        assert_eq!(normalize("/"), "/");
    }
}
