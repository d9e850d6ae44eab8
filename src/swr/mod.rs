//! Client-side stale-while-revalidate reads.

pub mod engine;
pub mod policy;
pub mod sink;

pub use engine::{Fetcher, SwrClient, SwrEvent};
pub use policy::RevalidationPolicy;
pub use sink::{ErrorSink, LoggingErrorSink};
