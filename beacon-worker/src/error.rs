use beacon_common::stream::StreamError;
use thiserror::Error;

/// Enumeration of errors a worker cycle can surface. Storage failures are
/// absorbed inside the cycle (batch retry, degraded load, poison drop) and
/// never bubble this far; only the stream log can fail a cycle outright,
/// and the run loop treats that as transient.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a stream log error occurred during the ingest cycle")]
    StreamError(#[from] StreamError),
}
