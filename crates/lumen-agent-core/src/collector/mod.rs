//! Cold path: rollup of completed traces into persisted transaction points.

pub mod aggregator;
pub mod repository;
pub mod transaction_point;

pub use aggregator::{TransactionAggregator, BACKGROUND_TYPE, FOREGROUND_TYPE};
pub use repository::{RepositoryError, TransactionPointRepository};
pub use transaction_point::{MergedMetric, TransactionPoint, TransactionPointBuilder};
