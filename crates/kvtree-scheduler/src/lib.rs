//! # kvtree scheduler
//!
//! Cache-aware request scheduling on top of the [`kvtree_cache::PrefixTree`].
//!
//! The scheduler owns the tree and is driven by an outer loop through explicit
//! step functions: [`PrefixAwareScheduler::step`] assembles the next batch and
//! [`PrefixAwareScheduler::on_batch_complete`] folds the model's output back in.
//! Nothing blocks; a request that cannot get memory simply stays queued for a
//! later tick.

pub mod batch;
pub mod metrics;
pub mod queue;
pub mod scheduler;

pub use batch::{Batch, BatchEntry, BatchKind};
pub use metrics::SchedulerMetrics;
pub use queue::WaitingQueue;
pub use scheduler::{FinishedRequest, PrefixAwareScheduler};
