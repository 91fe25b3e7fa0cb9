//! User preference embeddings.
//!
//! A user's preference vector is the signed, weight-normalised mean of the
//! embeddings of every post they reacted to, scaled to unit length. It is
//! always rebuilt from the full reaction set, never patched.

pub mod aggregate;
pub mod aggregator;
pub mod weights;

pub use aggregate::{contributing, euclidean_norm, weighted_mean_normalized, WeightedVector};
pub use aggregator::{PreferenceAggregator, PreferenceSink, ReactionHook, ReactionSource};
pub use weights::WeightTable;
