//! Correlation identifiers for asynchronous calls.
//!
//! A [`Reference`] matches a request sent over a channel to the reply that
//! arrives for it later, possibly on a different thread. Callers mint one
//! per outstanding call; uniqueness within a process is guaranteed by a
//! random per-process prefix plus an atomic counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// 128-bit unique call identifier.
///
/// The `first` half is a random per-process prefix, the `second` half a
/// monotonically increasing counter, so references minted by different
/// processes sharing a channel do not collide.
///
/// # Examples
///
/// ```
/// use stratus_core::Reference;
///
/// let a = Reference::fresh();
/// let b = Reference::fresh();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Reference {
    /// First 64 bits. For minted references, the per-process prefix.
    pub first: u64,
    /// Second 64 bits. For minted references, the counter value.
    pub second: u64,
}

/// Per-process random prefix, fixed at first use.
fn process_prefix() -> u64 {
    static PREFIX: OnceLock<u64> = OnceLock::new();
    *PREFIX.get_or_init(rand::random::<u64>)
}

impl Reference {
    /// Create a reference with explicit values.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Mint a fresh process-unique reference.
    pub fn fresh() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            first: process_prefix(),
            second: COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Check whether the reference is valid (non-zero).
    pub const fn is_valid(&self) -> bool {
        self.first != 0 || self.second != 0
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_fresh_references_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1024 {
            assert!(seen.insert(Reference::fresh()));
        }
    }

    #[test]
    fn test_fresh_references_share_prefix() {
        let a = Reference::fresh();
        let b = Reference::fresh();
        assert_eq!(a.first, b.first);
        assert!(b.second > a.second);
    }

    #[test]
    fn test_validity() {
        assert!(!Reference::default().is_valid());
        assert!(Reference::fresh().is_valid());
        assert!(Reference::new(0, 7).is_valid());
    }

    #[test]
    fn test_display_is_fixed_width_hex() {
        let r = Reference::new(0x1, 0x2);
        assert_eq!(r.to_string(), "00000000000000010000000000000002");
    }

    #[test]
    fn test_serde_roundtrip() {
        let r = Reference::fresh();
        let bytes = serde_json::to_vec(&r).expect("serialize reference");
        let back: Reference = serde_json::from_slice(&bytes).expect("deserialize reference");
        assert_eq!(r, back);
    }
}
