//! Work that runs detached from user requests: queued preference
//! recomputation and periodic embedding backfill.

pub mod backfill;
pub mod recompute_queue;

pub use backfill::{BackfillReport, EmbeddingBackfill};
pub use recompute_queue::{RecomputeQueue, RecomputeStats};
