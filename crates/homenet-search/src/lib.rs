//! # homenet-search
//!
//! The profile search engine's pure parts: wildcard translation, great-circle
//! geometry, storage-predicate derivation, and the result cache used for
//! paging.
//!
//! ## Two-stage filtering
//!
//! Stage 1 translates the client's wildcards and (center, radius) circle
//! into coarse predicates ([`TextPredicate`], [`GeoBounds`]) that the
//! persistence layer pushes into SQL. Stage 2 re-checks each candidate with
//! the exact great-circle distance and the extra-data substring filter in
//! memory. This crate owns both translations; the persistence layer and the
//! conversation layer apply them.

pub mod cache;
pub mod geo;
pub mod wildcard;

pub use cache::ResultCache;
pub use geo::{bounds_for, distance_m, GeoBounds};
pub use wildcard::TextPredicate;

/// Radius above which no geographic predicate is applied (metres).
pub const MAX_FILTERED_RADIUS_M: f64 = 5_000_000.0;
