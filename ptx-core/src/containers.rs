//! Hot-path container aliases used by executor and queue-manager state tables.
//!
//! Keeping the choice in one place lets the per-transaction maps switch hashing or allocation
//! policy without touching execution logic.

use hashbrown::{HashMap as HbMap, HashSet as HbSet};

/// Hot-path hash map used by transaction, dependency, and lock tables.
pub type HotMap<K, V> = HbMap<K, V>;

/// Hot-path hash set used for partition and dependency membership checks.
pub type HotSet<T> = HbSet<T>;
