//! Task keys.
//!
//! A pure submission derives its key from the function name and the
//! arguments, so identical calls collapse onto one computation. An impure
//! submission gets a random suffix instead.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::spec::Arg;

/// Identifier of a unit of work, unique within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Deterministic key for a pure call of `function` with the given arguments.
    pub fn pure(function: &str, args: &[Arg], kwargs: &BTreeMap<String, Arg>) -> Self {
        Self(format!("{function}-{}", tokenize(function, args, kwargs)))
    }

    /// Fresh key for an impure call; never equal to any other key.
    pub fn unique(function: &str) -> Self {
        Self(format!("{function}-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name group used for duration statistics.
    ///
    /// Leading `-`-separated segments are kept until the first segment that
    /// looks like a token or an index: `slowinc-3fa1...` and `inc-0-3` both
    /// map to their function name.
    pub fn prefix(&self) -> String {
        let words: Vec<&str> = self
            .0
            .split('-')
            .take_while(|w| !is_token_like(w))
            .collect();
        if words.is_empty() {
            self.0.clone()
        } else {
            words.join("-")
        }
    }
}

fn is_token_like(word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    if word.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    word.len() >= 8 && word.chars().all(|c| c.is_ascii_hexdigit())
}

/// Hash a call into a stable hex token.
///
/// `kwargs` is a `BTreeMap`, so keyword order never changes the token.
pub fn tokenize(function: &str, args: &[Arg], kwargs: &BTreeMap<String, Arg>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(function.as_bytes());
    hasher.update([0u8]);
    // Arg serialization is infallible: it only contains JSON values and keys.
    hasher.update(serde_json::to_vec(args).unwrap_or_default());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(kwargs).unwrap_or_default());
    hasher
        .finalize()
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_keys_are_deterministic() {
        let args = vec![Arg::from(1), Arg::from(2)];
        let a = TaskKey::pure("add", &args, &BTreeMap::new());
        let b = TaskKey::pure("add", &args, &BTreeMap::new());
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("add-"));
    }

    #[test]
    fn pure_keys_depend_on_arguments_and_function() {
        let k1 = TaskKey::pure("add", &[Arg::from(1)], &BTreeMap::new());
        let k2 = TaskKey::pure("add", &[Arg::from(2)], &BTreeMap::new());
        let k3 = TaskKey::pure("sub", &[Arg::from(1)], &BTreeMap::new());
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);

        let mut kw = BTreeMap::new();
        kw.insert("y".to_string(), Arg::from(4));
        let k4 = TaskKey::pure("add", &[Arg::from(1)], &kw);
        assert_ne!(k1, k4);
    }

    #[test]
    fn unique_keys_differ() {
        assert_ne!(TaskKey::unique("random"), TaskKey::unique("random"));
    }

    #[test]
    fn prefix_strips_tokens_and_indices() {
        let k = TaskKey::pure("slowinc", &[Arg::from(1)], &BTreeMap::new());
        assert_eq!(k.prefix(), "slowinc");
        assert_eq!(TaskKey::new("inc-0-3").prefix(), "inc");
        assert_eq!(TaskKey::new("x").prefix(), "x");
        assert_eq!(TaskKey::new("load-data-7").prefix(), "load-data");
    }
}
