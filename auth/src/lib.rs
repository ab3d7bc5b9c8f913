//! Path-pattern authorization matcher.
//!
//! Resolves a repository path to a callable rule, gating `read`/`write` on
//! every item access. Built-in rules for the `/sys/**` family always take
//! precedence and can't be overridden; anything else is open by default
//! unless a caller registers a catch-all.
mod matcher;
mod session;

pub use matcher::{AuthMatcher, Op, Pattern, Rule, RulePredicate};
pub use session::Session;
