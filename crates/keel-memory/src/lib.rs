pub mod db;
pub mod error;
pub mod ingest;
pub mod store;
pub mod types;

pub use error::MemoryError;
pub use ingest::{IngestTask, MemoryIngestor};
pub use store::{InMemoryMemoryStore, MemoryStore};
pub use types::{Entity, Episode, Relationship};
