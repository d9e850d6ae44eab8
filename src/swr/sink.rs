//! Global error sink for client reads. Every error that survives the retry budget is
//! reported here once, with its key.

use tracing::error;

use crate::core::error::CacheError;

pub trait ErrorSink: Send + Sync {
    fn report(&self, key: &str, error: &CacheError);
}

/// Logs each error; never notifies users
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn report(&self, key: &str, err: &CacheError) {
        error!(
            key = %key,
            error = %err,
            error_type = err.error_type(),
            status = ?err.status(),
            "Revalidation request error"
        );
    }
}
