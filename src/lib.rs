// Transaction Loader - Core Library
// Streams an XML transaction feed into SQLite through a bounded store and a
// pool of batch writers. Exposes all modules for the CLI and tests.

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod logging;
pub mod pipeline;
pub mod reader;
pub mod store;
pub mod writer;

// Re-export commonly used types
pub use config::{ConfigOverrides, LoaderConfig};
pub use db::{RunRecord, SqliteGateway, StoredCounts, StoredTransaction};
pub use entities::{Client, Place, Transaction};
pub use error::{IngestError, ValidationError};
pub use gateway::{NaturalKeyCache, PersistenceGateway};
pub use keys::{derive_key, KeyRegistry};
pub use logging::init_logging;
pub use pipeline::{worker_count, Pipeline, RunOutcome, RunSummary};
pub use reader::{FeedReader, FeedSource, ReaderReport};
pub use store::{StoreLimits, TransactionStore};
pub use writer::{BatchWriter, WriterReport};
