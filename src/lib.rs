//! # An in-memory ordered key-value index on a B+ tree
//!
//! `bptree` provides [`BPlusTreeMap`], an ordered map from totally-ordered
//! keys to opaque values.  All values live in the leaves, which are chained
//! into a doubly-linked list, so ordered scans never climb back through the
//! branches.  Unlike a plain map, a key may hold *several* values: `insert`
//! replaces whatever a key held, while `append` accumulates values in
//! insertion order.
//!
//! The tree's fan-out ("order") is picked at construction time and clamped
//! to [`MIN_ORDER`].  The structure is not thread-safe; wrap it in a lock if
//! you need to share it.
//!
//! # Examples
//!
//! ```
//! use bptree::BPlusTreeMap;
//!
//! let mut index = BPlusTreeMap::new(8);
//! index.insert("b", 2);
//! index.insert("a", 1);
//! index.append("b", 22);
//!
//! assert_eq!(index.get("a"), Some(&1));
//! assert_eq!(index.get_all("b"), Some(vec![&2, &22]));
//!
//! let keys: Vec<&str> = index.keys().copied().collect();
//! assert_eq!(keys, ["a", "b", "b"]);
//!
//! assert_eq!(index.remove("b"), Some(22));
//! assert_eq!(index.len(), 2);
//! ```

mod bplus;

pub use bplus::{BPlusTreeMap, IntoIter, Iter, Range, DEFAULT_ORDER, MIN_ORDER};
