//! Resource API clients and the transport they delegate to.

pub mod client;
pub mod transport;

pub use client::{ResourceApi, ServerApi, DEFAULT_BASE_URL};
pub use transport::{HttpMethod, HttpTransport, RequestOptions, Transport, TransportRequest};
