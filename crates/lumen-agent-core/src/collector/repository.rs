//! Persistence sink for sealed transaction points.
//!
//! The collector never talks to storage directly; the host wires in an
//! implementation of [`TransactionPointRepository`] (a database writer, an
//! intake client, a test recorder) and the window flusher calls it once per
//! transaction type bucket.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::collector::transaction_point::TransactionPoint;

/// Errors a repository implementation may surface to the flusher.
///
/// The flusher logs these and moves on; transaction points are never
/// retried.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Underlying I/O failed while writing a point.
    #[error("i/o failure writing transaction point: {0}")]
    Io(#[from] std::io::Error),

    /// A point could not be serialized into the repository's format.
    #[error("failed to serialize transaction point: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Sink receiving one sealed rollup per (window, transaction type).
#[async_trait]
pub trait TransactionPointRepository: Send + Sync {
    /// Stores the overall point and the per-transaction-name points for one
    /// transaction type bucket of one window.
    async fn store(
        &self,
        transaction_type: &str,
        overall: TransactionPoint,
        per_transaction: HashMap<String, TransactionPoint>,
    ) -> Result<(), RepositoryError>;
}
