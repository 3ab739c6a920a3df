//! Delivery core: the event store contract and its implementations, the retry
//! policy, and the ingest service that feeds the store.

pub mod backoff;
pub mod error;
pub mod ingest;
pub mod store;

pub use backoff::RetryPolicy;
pub use error::StoreError;
pub use ingest::{IngestRequest, IngestService, Ingested};
pub use store::{EnqueueResult, EventStore, MemoryEventStore, PgEventStore};
