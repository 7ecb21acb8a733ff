//! Application services in front of the domain: batch ingestion on the write side, reports
//! and progress on the read side.

pub mod batch_service;
pub mod coalescer;
pub mod query_service;

pub use batch_service::{BatchService, FileUpload};
pub use coalescer::RequestCoalescer;
pub use query_service::{report_cache_key, QueryService};
