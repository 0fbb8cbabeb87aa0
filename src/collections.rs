//! Hash collections used by aggregation to track trees and relative paths.
//!
//! With the `gxhash` feature the tables use gxhash, which needs AES-NI and SSE2
//! (or their ARM counterparts). Without it they fall back to std's SipHash.
//! Create instances with `Default::default()`, which works for both.

#[cfg(feature = "gxhash")]
type BuildHasher = gxhash::GxBuildHasher;

#[cfg(not(feature = "gxhash"))]
type BuildHasher = std::collections::hash_map::RandomState;

/// HashMap with the crate's preferred hasher
pub type HashMap<K, V> = std::collections::HashMap<K, V, BuildHasher>;

/// HashSet with the crate's preferred hasher
pub type HashSet<T> = std::collections::HashSet<T, BuildHasher>;
