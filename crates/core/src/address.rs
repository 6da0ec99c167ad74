use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lightweight token naming a reachable endpoint (scheduler, worker or client).
///
/// Workers are always referred to by address, never by a live object
/// reference, so a departure is a pure index update on every holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// In-process endpoint with the given name.
    pub fn inproc(name: &str) -> Self {
        Self(format!("inproc://{name}"))
    }

    /// The well-known scheduler endpoint.
    pub fn scheduler() -> Self {
        Self::inproc("scheduler")
    }

    /// A fresh worker identity. Restarted workers never reuse an address.
    pub fn fresh_worker() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self::inproc(&format!("worker-{}", &id[..12]))
    }

    /// A fresh client identity.
    pub fn fresh_client() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self::inproc(&format!("client-{}", &id[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_workers_are_distinct() {
        let a = Address::fresh_worker();
        let b = Address::fresh_worker();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("inproc://worker-"));
    }

    #[test]
    fn scheduler_address_is_stable() {
        assert_eq!(Address::scheduler().to_string(), "inproc://scheduler");
    }
}
