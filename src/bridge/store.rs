//! Store boundary
//!
//! The bridge talks to the table service only through these traits.
//!
//! Implementations:
//! - `InMemoryConnector` / `InMemoryTableStore`: development and tests

use super::types::{LogRecord, Row, Schema, TablePath};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub const BOOTSTRAP_SERVERS_KEY: &str = "bootstrap.servers";

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    DatabaseNotFound(String),
    DatabaseAlreadyExists(String),
    /// Database still has tables and the drop was not cascading
    DatabaseNotEmpty(String),
    TableNotFound(TablePath),
    TableAlreadyExists(TablePath),
    InvalidSchema(String),
    /// A row does not fit the table's schema
    InvalidRow(String),
    /// Operation needs a primary key table
    NoPrimaryKey(TablePath),
    InvalidConfig(String),
    /// The store connection was closed
    Closed,
    Other(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseNotFound(db) => write!(f, "Database not found: {}", db),
            StoreError::DatabaseAlreadyExists(db) => write!(f, "Database already exists: {}", db),
            StoreError::DatabaseNotEmpty(db) => write!(f, "Database is not empty: {}", db),
            StoreError::TableNotFound(path) => write!(f, "Table not found: {}", path),
            StoreError::TableAlreadyExists(path) => write!(f, "Table already exists: {}", path),
            StoreError::InvalidSchema(msg) => write!(f, "Invalid schema: {}", msg),
            StoreError::InvalidRow(msg) => write!(f, "Invalid row: {}", msg),
            StoreError::NoPrimaryKey(path) => write!(f, "Table {} has no primary key", path),
            StoreError::InvalidConfig(msg) => write!(f, "Invalid client config: {}", msg),
            StoreError::Closed => write!(f, "Connection is closed"),
            StoreError::Other(msg) => write!(f, "Store error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Client settings passed to [`Connector::connect`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientConfig {
    pub bootstrap_servers: Vec<String>,
    /// Every other option, passed through untouched
    pub properties: BTreeMap<String, String>,
}

impl ClientConfig {
    pub fn with_bootstrap(servers: &str) -> Self {
        ClientConfig {
            bootstrap_servers: split_servers(servers),
            properties: BTreeMap::new(),
        }
    }

    /// Build from a flat option map; `bootstrap.servers` is comma separated
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        let mut properties = map;
        let bootstrap_servers = properties
            .remove(BOOTSTRAP_SERVERS_KEY)
            .map(|s| split_servers(&s))
            .unwrap_or_default();
        ClientConfig {
            bootstrap_servers,
            properties,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.bootstrap_servers.is_empty() {
            return Err(StoreError::InvalidConfig(format!("{} is empty", BOOTSTRAP_SERVERS_KEY)));
        }
        for server in &self.bootstrap_servers {
            let valid = server
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(StoreError::InvalidConfig(format!(
                    "bootstrap server {:?} is not host:port",
                    server
                )));
            }
        }
        Ok(())
    }
}

fn split_servers(servers: &str) -> Vec<String> {
    servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Opens connections to the table service
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, config: &'a ClientConfig) -> StoreFuture<'a, Arc<dyn TableStore>>;
}

/// An open connection: admin operations plus table reads and writes
pub trait TableStore: Send + Sync + 'static {
    fn create_database<'a>(&'a self, name: &'a str, comment: Option<&'a str>) -> StoreFuture<'a, ()>;

    fn drop_database<'a>(&'a self, name: &'a str, cascade: bool) -> StoreFuture<'a, ()>;

    fn database_exists<'a>(&'a self, name: &'a str) -> StoreFuture<'a, bool>;

    fn list_databases(&self) -> StoreFuture<'_, Vec<String>>;

    fn list_tables<'a>(&'a self, database: &'a str) -> StoreFuture<'a, Vec<String>>;

    fn table_exists<'a>(&'a self, path: &'a TablePath) -> StoreFuture<'a, bool>;

    fn create_table<'a>(&'a self, path: &'a TablePath, schema: &'a Schema) -> StoreFuture<'a, ()>;

    fn drop_table<'a>(&'a self, path: &'a TablePath) -> StoreFuture<'a, ()>;

    fn table_schema<'a>(&'a self, path: &'a TablePath) -> StoreFuture<'a, Schema>;

    /// Insert or replace rows by primary key
    fn upsert<'a>(&'a self, path: &'a TablePath, rows: Vec<Row>) -> StoreFuture<'a, ()>;

    /// Append rows to a log table
    fn append<'a>(&'a self, path: &'a TablePath, rows: Vec<Row>) -> StoreFuture<'a, ()>;

    /// Delete rows by primary key; only key columns are read
    fn delete<'a>(&'a self, path: &'a TablePath, rows: Vec<Row>) -> StoreFuture<'a, ()>;

    /// Current contents, at most `limit` rows
    fn scan<'a>(&'a self, path: &'a TablePath, limit: usize) -> StoreFuture<'a, Vec<Row>>;

    /// Changelog entries starting at `from_offset`, at most `max` of them
    fn read_log<'a>(&'a self, path: &'a TablePath, from_offset: i64, max: usize) -> StoreFuture<'a, Vec<LogRecord>>;

    fn close(&self) -> StoreFuture<'_, ()>;
}
