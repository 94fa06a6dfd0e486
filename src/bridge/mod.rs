//! Bridge facade over the table service
//!
//! ```text
//! peer call ──► dispatch ──► FlussBridge ──► WriterCache ──┐
//!                               │                          ▼
//!                               └──► TableReader ──► dyn TableStore
//! ```

mod dispatch;
pub mod facade;
pub mod memory;
pub mod reader;
pub mod schema;
pub mod store;
pub mod types;
pub mod writer;

pub use facade::{FlussBridge, DEFAULT_DATABASE_COMMENT, READ_TABLE_DATA_DEFAULT};
pub use memory::{InMemoryConnector, InMemoryTableStore};
pub use reader::{TableReader, SCAN_LIMIT_DEFAULT};
pub use schema::Record;
pub use store::{ClientConfig, Connector, StoreError, StoreFuture, TableStore};
pub use types::{ChangeType, DataType, Datum, Field, LogRecord, Row, ScanKind, Schema, TablePath};
pub use writer::{TableWriter, WriteMode, WriterCache};
