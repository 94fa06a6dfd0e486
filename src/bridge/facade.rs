//! Bridge facade
//!
//! Every operation catches its own failures, logs them, and returns a benign
//! value (`false`, empty, `None`). One bad call never takes the gateway down.

use super::reader::{TableReader, SCAN_LIMIT_DEFAULT};
use super::schema::{record_to_row, schema_fields, schema_to_map, Record};
use super::store::{ClientConfig, Connector, StoreError, TableStore};
use super::types::{DataType, Row, ScanKind, Schema, TablePath};
use super::writer::{WriteMode, WriterCache};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const DEFAULT_DATABASE_COMMENT: &str = "Created by Python client";

/// Records returned by `read_table_data` when no maximum is given
pub const READ_TABLE_DATA_DEFAULT: usize = 10;

struct Connection {
    store: Arc<dyn TableStore>,
    config: ClientConfig,
}

pub struct FlussBridge {
    connector: Arc<dyn Connector>,
    connection: RwLock<Option<Connection>>,
    schemas: RwLock<HashMap<TablePath, Schema>>,
    writers: WriterCache,
}

impl FlussBridge {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        FlussBridge {
            connector,
            connection: RwLock::new(None),
            schemas: RwLock::new(HashMap::new()),
            writers: WriterCache::new(),
        }
    }

    fn store(&self) -> Result<Arc<dyn TableStore>, StoreError> {
        self.connection
            .read()
            .as_ref()
            .map(|c| c.store.clone())
            .ok_or(StoreError::Closed)
    }

    async fn schema_of(&self, store: &dyn TableStore, path: &TablePath) -> Result<Schema, StoreError> {
        let cached = self.schemas.read().get(path).cloned();
        if let Some(schema) = cached {
            return Ok(schema);
        }
        let schema = store.table_schema(path).await?;
        self.schemas.write().insert(path.clone(), schema.clone());
        Ok(schema)
    }

    fn forget_table(&self, path: &TablePath) {
        self.schemas.write().remove(path);
        self.writers.remove_table(path);
    }

    // ==================== Connection ====================

    pub async fn connect(&self, bootstrap_servers: &str) -> bool {
        self.connect_with(ClientConfig::with_bootstrap(bootstrap_servers)).await
    }

    pub async fn connect_with_config(&self, options: BTreeMap<String, String>) -> bool {
        self.connect_with(ClientConfig::from_map(options)).await
    }

    async fn connect_with(&self, config: ClientConfig) -> bool {
        match self.connector.connect(&config).await {
            Ok(store) => {
                if self.is_connected() {
                    info!("Replacing existing connection");
                    self.close().await;
                }
                info!("Connected to {:?}", config.bootstrap_servers);
                *self.connection.write() = Some(Connection { store, config });
                true
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    /// Flush and drop writers, clear caches, close the connection
    pub async fn close(&self) {
        let taken = self.connection.write().take();
        let Some(connection) = taken else {
            return;
        };
        if let Err(e) = self.writers.close_all(connection.store.as_ref()).await {
            warn!("Failed to flush writers on close: {}", e);
        }
        self.schemas.write().clear();
        if let Err(e) = connection.store.close().await {
            warn!("Failed to close connection: {}", e);
        }
        info!("Connection closed");
    }

    pub async fn connection_info(&self) -> String {
        let (store, servers) = {
            let guard = self.connection.read();
            match guard.as_ref() {
                Some(c) => (c.store.clone(), c.config.bootstrap_servers.join(",")),
                None => return "Not connected".to_string(),
            }
        };

        let databases = match store.list_databases().await {
            Ok(dbs) => dbs,
            Err(e) => return format!("Failed to get connection info: {}", e),
        };

        let mut info = String::new();
        let _ = writeln!(info, "Status: connected");
        let _ = writeln!(info, "Bootstrap servers: {}", servers);
        let _ = writeln!(info, "Databases: {}", databases.len());
        for db in &databases {
            let tables = store.list_tables(db).await.map(|t| t.len()).unwrap_or(0);
            let _ = writeln!(info, "Database {} tables: {}", db, tables);
        }
        info
    }

    // ==================== Databases ====================

    pub async fn create_database(&self, database: &str, comment: Option<&str>) -> bool {
        let comment = match comment {
            None => Some(DEFAULT_DATABASE_COMMENT),
            Some(c) if c.trim().is_empty() => None,
            Some(c) => Some(c),
        };
        let result = async { self.store()?.create_database(database, comment).await }.await;
        benign_bool(result, || format!("create database {}", database))
    }

    pub async fn drop_database(&self, database: &str) -> bool {
        let result = async { self.store()?.drop_database(database, false).await }.await;
        if result.is_ok() {
            let stale: Vec<TablePath> = self
                .schemas
                .read()
                .keys()
                .filter(|p| p.database == database)
                .cloned()
                .collect();
            for path in &stale {
                self.forget_table(path);
            }
        }
        benign_bool(result, || format!("drop database {}", database))
    }

    pub async fn database_exists(&self, database: &str) -> bool {
        let result = async { self.store()?.database_exists(database).await }.await;
        benign(result, || format!("check database {}", database))
    }

    pub async fn list_databases(&self) -> Vec<String> {
        let result = async { self.store()?.list_databases().await }.await;
        benign(result, || "list databases".to_string())
    }

    pub async fn database_info(&self, database: &str) -> String {
        if !self.database_exists(database).await {
            return "Database does not exist".to_string();
        }
        let tables = self.list_tables(database).await;

        let mut info = String::new();
        let _ = writeln!(info, "Database: {}", database);
        let _ = writeln!(info, "Tables: {}", tables.len());
        for table in &tables {
            let _ = writeln!(info, "  - {}", table);
        }
        info
    }

    // ==================== Tables ====================

    pub async fn list_tables(&self, database: &str) -> Vec<String> {
        let result = async { self.store()?.list_tables(database).await }.await;
        benign(result, || format!("list tables in {}", database))
    }

    pub async fn table_exists(&self, database: &str, table: &str) -> bool {
        let path = TablePath::new(database, table);
        let result = async { self.store()?.table_exists(&path).await }.await;
        benign(result, || format!("check table {}", path))
    }

    /// Create a table from parallel name/type lists.
    ///
    /// Mismatched list lengths return false without touching the store.
    pub async fn create_table(
        &self,
        database: &str,
        table: &str,
        field_names: &[String],
        field_types: &[String],
        primary_keys: &[String],
    ) -> bool {
        if field_names.len() != field_types.len() {
            warn!(
                "Cannot create {}.{}: {} field names but {} field types",
                database,
                table,
                field_names.len(),
                field_types.len()
            );
            return false;
        }

        let columns = field_names
            .iter()
            .zip(field_types)
            .map(|(name, ty)| (name.clone(), DataType::parse(ty)))
            .collect();
        let schema = Schema::new(columns, primary_keys.to_vec());
        let path = TablePath::new(database, table);

        let result = async { self.store()?.create_table(&path, &schema).await }.await;
        if result.is_ok() {
            info!("Created table {}", path);
            self.schemas.write().insert(path.clone(), schema);
        }
        benign_bool(result, || format!("create table {}", path))
    }

    /// `id BIGINT, name STRING, age INTEGER, created_time TIMESTAMP(3)`, keyed on `id`
    pub async fn create_simple_table(&self, database: &str, table: &str) -> bool {
        let names = ["id", "name", "age", "created_time"].map(String::from);
        let types = ["BIGINT", "STRING", "INTEGER", "TIMESTAMP(3)"].map(String::from);
        self.create_table(database, table, &names, &types, &["id".to_string()])
            .await
    }

    pub async fn drop_table(&self, database: &str, table: &str) -> bool {
        let path = TablePath::new(database, table);
        let result = async { self.store()?.drop_table(&path).await }.await;
        if result.is_ok() {
            self.forget_table(&path);
            info!("Dropped table {}", path);
        }
        benign_bool(result, || format!("drop table {}", path))
    }

    pub async fn table_schema(&self, database: &str, table: &str) -> Record {
        let path = TablePath::new(database, table);
        let result = async {
            let store = self.store()?;
            self.schema_of(store.as_ref(), &path).await
        }
        .await;

        match result {
            Ok(schema) => {
                let mut map = schema_to_map(&schema);
                map.insert("database".to_string(), json!(database));
                map.insert("table".to_string(), json!(table));
                map
            }
            Err(e) => {
                warn!("Failed to get schema of {}: {}", path, e);
                Record::new()
            }
        }
    }

    pub async fn table_fields(&self, database: &str, table: &str) -> Vec<Value> {
        let path = TablePath::new(database, table);
        let result = async {
            let store = self.store()?;
            self.schema_of(store.as_ref(), &path).await
        }
        .await;
        benign(result.map(|s| schema_fields(&s)), || format!("get fields of {}", path))
    }

    // ==================== Writes ====================

    async fn write(&self, database: &str, table: &str, mode: WriteMode, records: &[Record], delete: bool) -> Result<usize, StoreError> {
        let path = TablePath::new(database, table);
        let store = self.store()?;
        let schema = self.schema_of(store.as_ref(), &path).await?;

        // Convert everything first so a bad record rejects the whole call
        let rows = records
            .iter()
            .map(|r| record_to_row(&schema, r))
            .collect::<Result<Vec<Row>, StoreError>>()?;

        self.writers
            .writer(&path, mode, &schema)
            .write_rows(store.as_ref(), rows, delete)
            .await
    }

    pub async fn upsert_record(&self, database: &str, table: &str, record: &Record) -> bool {
        let result = self
            .write(database, table, WriteMode::Upsert, std::slice::from_ref(record), false)
            .await;
        benign_bool(result, || format!("upsert into {}.{}", database, table))
    }

    pub async fn append_record(&self, database: &str, table: &str, record: &Record) -> bool {
        let result = self
            .write(database, table, WriteMode::Append, std::slice::from_ref(record), false)
            .await;
        benign_bool(result, || format!("append to {}.{}", database, table))
    }

    /// Delete by primary key; only key columns of `record` matter
    pub async fn delete_record(&self, database: &str, table: &str, record: &Record) -> bool {
        let result = self
            .write(database, table, WriteMode::Upsert, std::slice::from_ref(record), true)
            .await;
        benign_bool(result, || format!("delete from {}.{}", database, table))
    }

    /// Batch append to a log table
    pub async fn append_data(&self, database: &str, table: &str, records: &[Record]) -> bool {
        let result = self.write(database, table, WriteMode::Append, records, false).await;
        benign_bool(result, || format!("append {} records to {}.{}", records.len(), database, table))
    }

    /// Batch upsert into a primary key table
    pub async fn insert_data(&self, database: &str, table: &str, records: &[Record]) -> bool {
        let result = self.write(database, table, WriteMode::Upsert, records, false).await;
        benign_bool(result, || format!("insert {} records into {}.{}", records.len(), database, table))
    }

    pub async fn flush_all_writers(&self) {
        let result = async { self.writers.flush_all(self.store()?.as_ref()).await }.await;
        match result {
            Ok(n) => debug!("Flushed {} pending changes", n),
            Err(e) => warn!("Failed to flush writers: {}", e),
        }
    }

    pub async fn close_all_writers(&self) {
        match self.store() {
            Ok(store) => {
                if let Err(e) = self.writers.close_all(store.as_ref()).await {
                    warn!("Failed to close writers: {}", e);
                }
            }
            Err(_) => self.writers.clear(),
        }
    }

    pub fn writer_stats(&self) -> BTreeMap<String, u64> {
        self.writers.stats()
    }

    // ==================== Reads ====================

    /// Open a reader; `None` when the table or scan type is unusable
    pub async fn create_scan_reader(
        &self,
        database: &str,
        table: &str,
        scan_type: Option<&str>,
        limit: Option<usize>,
    ) -> Option<TableReader> {
        let scan_type = scan_type.unwrap_or("snapshot");
        let Some(kind) = ScanKind::parse(scan_type) else {
            warn!("Unsupported scan type: {}", scan_type);
            return None;
        };
        let limit = match limit {
            Some(0) => {
                warn!("Scan limit must be positive");
                return None;
            }
            Some(n) => n,
            None => SCAN_LIMIT_DEFAULT,
        };

        let path = TablePath::new(database, table);
        let result = async {
            let store = self.store()?;
            let schema = self.schema_of(store.as_ref(), &path).await?;
            Ok::<_, StoreError>(TableReader::new(store, path.clone(), schema, kind, limit))
        }
        .await;

        match result {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!("Failed to create {} reader on {}: {}", kind.name(), path, e);
                None
            }
        }
    }

    pub async fn create_lookup_reader(&self, database: &str, table: &str) -> Option<TableReader> {
        self.create_scan_reader(database, table, Some("lookup"), None).await
    }

    pub async fn create_log_reader(&self, database: &str, table: &str) -> Option<TableReader> {
        self.create_scan_reader(database, table, Some("log"), None).await
    }

    /// One-shot snapshot read of at most `max_records` records
    pub async fn read_table_data(&self, database: &str, table: &str, max_records: Option<usize>) -> Vec<Record> {
        let max = max_records.unwrap_or(READ_TABLE_DATA_DEFAULT);
        if max == 0 {
            return Vec::new();
        }
        match self.create_scan_reader(database, table, Some("snapshot"), Some(max)).await {
            Some(reader) => {
                let records = reader.read_records(max).await;
                reader.close();
                records
            }
            None => Vec::new(),
        }
    }

    pub async fn is_table_empty(&self, database: &str, table: &str) -> bool {
        self.read_table_data(database, table, Some(1)).await.is_empty()
    }

    pub async fn check_table_health(&self, database: &str, table: &str) -> Record {
        let mut health = Record::new();
        let exists = self.table_exists(database, table).await;
        health.insert("exists".to_string(), json!(exists));

        if exists {
            let reader = self.create_scan_reader(database, table, None, None).await;
            health.insert("accessible".to_string(), json!(reader.is_some()));
            health.insert("readable".to_string(), json!(reader.is_some()));
            if let Some(reader) = reader {
                let sample = reader.read_records(1).await;
                health.insert("has_data".to_string(), json!(!sample.is_empty()));
                health.insert("sample_record_count".to_string(), json!(sample.len()));
                reader.close();
            }
        }

        let status = if self.is_connected() { "healthy" } else { "error" };
        health.insert("status".to_string(), json!(status));
        if !self.is_connected() {
            health.insert("error".to_string(), json!("not connected"));
        }
        health.insert("check_time".to_string(), json!(now_ms()));
        health
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn benign<T: Default>(result: Result<T, StoreError>, what: impl FnOnce() -> String) -> T {
    result.unwrap_or_else(|e| {
        warn!("Failed to {}: {}", what(), e);
        T::default()
    })
}

fn benign_bool<T>(result: Result<T, StoreError>, what: impl FnOnce() -> String) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to {}: {}", what(), e);
            false
        }
    }
}
