//! Error types for the engine.
//!
//! Every fallible engine operation returns [`Result`], whose error side is the
//! [`EngineError`] enum. UDF code itself returns [`anyhow::Result`]; the engine wraps
//! those failures into [`EngineError::UdfUser`] together with the partition they
//! happened in.
//!
//! Errors fall into two retry classes (see [`EngineError::is_transient`]):
//! infrastructure failures such as a lost worker or a failed read are retried up to
//! the configured retry budget, everything else is deterministic and aborts the run
//! immediately.

use crate::ids::PartitionId;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// All errors the engine can report.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The dataset cannot be partitioned under the requested size hint.
    #[error("dataset shape error: {0}")]
    DatasetShape(String),

    /// Two partitions wrote the same element of a REPLACE-kind buffer.
    #[error(
        "value overwrite in buffer '{buffer}' of UDF '{udf}': element {index} already written (partition {partition})"
    )]
    ValueOverwrite {
        udf: String,
        buffer: String,
        index: usize,
        partition: PartitionId,
    },

    /// A partition exceeded its retry budget.
    #[error("partition {partition} failed after {attempts} attempts: {last_error}")]
    WorkerExhausted {
        partition: PartitionId,
        attempts: u32,
        last_error: String,
    },

    /// A UDF failed (or panicked) while processing a partition.
    #[error("UDF '{udf}' failed in partition {partition}: {source}")]
    UdfUser {
        udf: String,
        partition: PartitionId,
        #[source]
        source: anyhow::Error,
    },

    /// A kernel failed to compile.
    #[error("kernel '{kernel}' ({signature}) failed to compile: {message}")]
    Compile {
        kernel: String,
        signature: String,
        message: String,
    },

    /// The run was cancelled before it completed.
    #[error("run cancelled")]
    Cancelled,

    /// Invalid configuration or buffer declaration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A per-task buffer set does not match the declared specs.
    #[error("buffer mismatch: {0}")]
    BufferMismatch(String),

    /// A read of partition data failed.
    #[error("read of partition {partition} failed: {message}")]
    Read {
        partition: PartitionId,
        message: String,
    },

    /// A worker or the cluster transport reported an infrastructure failure.
    #[error("worker failure: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether retrying the failed task can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Read { .. } | Self::Worker(_))
    }

    pub(crate) fn udf(udf: &str, partition: PartitionId, source: anyhow::Error) -> Self {
        Self::UdfUser {
            udf: udf.to_string(),
            partition,
            source,
        }
    }
}
