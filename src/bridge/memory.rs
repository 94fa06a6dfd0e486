//! In-memory table service
//!
//! Databases, tables, primary-key upserts and a per-table changelog, kept in
//! one shared map. Every connection made through the same
//! [`InMemoryConnector`] sees the same data.

use super::store::{ClientConfig, Connector, StoreError, StoreFuture, TableStore};
use super::types::{ChangeType, DataType, Datum, LogRecord, Row, Schema, TablePath};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct Catalog {
    databases: BTreeMap<String, DatabaseState>,
}

#[derive(Debug, Default)]
struct DatabaseState {
    comment: Option<String>,
    tables: BTreeMap<String, TableState>,
}

#[derive(Debug)]
struct TableState {
    schema: Schema,
    rows: Vec<Row>,
    log: Vec<LogRecord>,
}

impl TableState {
    fn new(schema: Schema) -> Self {
        TableState {
            schema,
            rows: Vec::new(),
            log: Vec::new(),
        }
    }

    fn record(&mut self, change_type: ChangeType, row: Row) {
        let offset = self.log.len() as i64;
        self.log.push(LogRecord {
            offset,
            timestamp: now_ms(),
            change_type,
            row,
        });
    }

    fn key_of(&self, row: &Row) -> Vec<Datum> {
        self.schema
            .primary_key_indexes()
            .into_iter()
            .map(|i| row[i].clone())
            .collect()
    }

    fn position_of(&self, key: &[Datum]) -> Option<usize> {
        self.rows.iter().position(|r| self.key_of(r) == key)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn datum_matches(datum: &Datum, data_type: DataType) -> bool {
    matches!(
        (datum, data_type),
        (Datum::Null, _)
            | (Datum::Boolean(_), DataType::Boolean)
            | (Datum::TinyInt(_), DataType::TinyInt)
            | (Datum::SmallInt(_), DataType::SmallInt)
            | (Datum::Int(_), DataType::Int)
            | (Datum::BigInt(_), DataType::BigInt)
            | (Datum::Float(_), DataType::Float)
            | (Datum::Double(_), DataType::Double)
            | (Datum::String(_), DataType::String)
            | (Datum::Bytes(_), DataType::Bytes)
            | (Datum::Timestamp(_), DataType::Timestamp(_))
    )
}

fn check_row(schema: &Schema, row: &Row) -> Result<(), StoreError> {
    if row.len() != schema.fields.len() {
        return Err(StoreError::InvalidRow(format!(
            "expected {} columns, got {}",
            schema.fields.len(),
            row.len()
        )));
    }
    for (field, datum) in schema.fields.iter().zip(row) {
        if datum.is_null() && !field.nullable {
            return Err(StoreError::InvalidRow(format!("column {} is not nullable", field.name)));
        }
        if !datum_matches(datum, field.data_type) {
            return Err(StoreError::InvalidRow(format!(
                "column {} expects {}, got {:?}",
                field.name, field.data_type, datum
            )));
        }
    }
    Ok(())
}

/// Shared in-memory catalog behind a connection
#[derive(Debug, Clone, Default)]
pub struct InMemoryTableStore {
    catalog: Arc<RwLock<Catalog>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Another handle on the same catalog with its own open/closed state
    fn reopen(&self) -> Self {
        InMemoryTableStore {
            catalog: Arc::clone(&self.catalog),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn with_table<T>(
        &self,
        path: &TablePath,
        f: impl FnOnce(&mut TableState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.ensure_open()?;
        let mut catalog = self.catalog.write();
        let table = catalog
            .databases
            .get_mut(&path.database)
            .and_then(|db| db.tables.get_mut(&path.table))
            .ok_or_else(|| StoreError::TableNotFound(path.clone()))?;
        f(table)
    }

    /// Comment recorded for `database`
    pub fn database_comment(&self, database: &str) -> Option<String> {
        self.catalog
            .read()
            .databases
            .get(database)
            .and_then(|db| db.comment.clone())
    }
}

impl TableStore for InMemoryTableStore {
    fn create_database<'a>(&'a self, name: &'a str, comment: Option<&'a str>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if name.trim().is_empty() {
                return Err(StoreError::Other("database name is empty".to_string()));
            }
            let mut catalog = self.catalog.write();
            if catalog.databases.contains_key(name) {
                return Err(StoreError::DatabaseAlreadyExists(name.to_string()));
            }
            catalog.databases.insert(
                name.to_string(),
                DatabaseState {
                    comment: comment.map(str::to_string),
                    tables: BTreeMap::new(),
                },
            );
            debug!("Created database {}", name);
            Ok(())
        })
    }

    fn drop_database<'a>(&'a self, name: &'a str, cascade: bool) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut catalog = self.catalog.write();
            let db = catalog
                .databases
                .get(name)
                .ok_or_else(|| StoreError::DatabaseNotFound(name.to_string()))?;
            if !cascade && !db.tables.is_empty() {
                return Err(StoreError::DatabaseNotEmpty(name.to_string()));
            }
            catalog.databases.remove(name);
            Ok(())
        })
    }

    fn database_exists<'a>(&'a self, name: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.ensure_open()?;
            Ok(self.catalog.read().databases.contains_key(name))
        })
    }

    fn list_databases(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move {
            self.ensure_open()?;
            Ok(self.catalog.read().databases.keys().cloned().collect())
        })
    }

    fn list_tables<'a>(&'a self, database: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.ensure_open()?;
            let catalog = self.catalog.read();
            let db = catalog
                .databases
                .get(database)
                .ok_or_else(|| StoreError::DatabaseNotFound(database.to_string()))?;
            Ok(db.tables.keys().cloned().collect())
        })
    }

    fn table_exists<'a>(&'a self, path: &'a TablePath) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.ensure_open()?;
            let catalog = self.catalog.read();
            Ok(catalog
                .databases
                .get(&path.database)
                .map(|db| db.tables.contains_key(&path.table))
                .unwrap_or(false))
        })
    }

    fn create_table<'a>(&'a self, path: &'a TablePath, schema: &'a Schema) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            schema.validate().map_err(StoreError::InvalidSchema)?;
            let mut catalog = self.catalog.write();
            let db = catalog
                .databases
                .get_mut(&path.database)
                .ok_or_else(|| StoreError::DatabaseNotFound(path.database.clone()))?;
            if db.tables.contains_key(&path.table) {
                return Err(StoreError::TableAlreadyExists(path.clone()));
            }
            db.tables.insert(path.table.clone(), TableState::new(schema.clone()));
            debug!("Created table {}", path);
            Ok(())
        })
    }

    fn drop_table<'a>(&'a self, path: &'a TablePath) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut catalog = self.catalog.write();
            catalog
                .databases
                .get_mut(&path.database)
                .and_then(|db| db.tables.remove(&path.table))
                .map(|_| ())
                .ok_or_else(|| StoreError::TableNotFound(path.clone()))
        })
    }

    fn table_schema<'a>(&'a self, path: &'a TablePath) -> StoreFuture<'a, Schema> {
        Box::pin(async move { self.with_table(path, |t| Ok(t.schema.clone())) })
    }

    fn upsert<'a>(&'a self, path: &'a TablePath, rows: Vec<Row>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_table(path, |table| {
                if !table.schema.has_primary_key() {
                    return Err(StoreError::NoPrimaryKey(path.clone()));
                }
                for row in &rows {
                    check_row(&table.schema, row)?;
                }
                for row in rows {
                    let key = table.key_of(&row);
                    match table.position_of(&key) {
                        Some(i) => {
                            let before = std::mem::replace(&mut table.rows[i], row.clone());
                            table.record(ChangeType::UpdateBefore, before);
                            table.record(ChangeType::UpdateAfter, row);
                        }
                        None => {
                            table.rows.push(row.clone());
                            table.record(ChangeType::Insert, row);
                        }
                    }
                }
                Ok(())
            })
        })
    }

    fn append<'a>(&'a self, path: &'a TablePath, rows: Vec<Row>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_table(path, |table| {
                if table.schema.has_primary_key() {
                    return Err(StoreError::Other(format!(
                        "{} has a primary key; use upsert",
                        path
                    )));
                }
                for row in &rows {
                    check_row(&table.schema, row)?;
                }
                for row in rows {
                    table.rows.push(row.clone());
                    table.record(ChangeType::AppendOnly, row);
                }
                Ok(())
            })
        })
    }

    fn delete<'a>(&'a self, path: &'a TablePath, rows: Vec<Row>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_table(path, |table| {
                if !table.schema.has_primary_key() {
                    return Err(StoreError::NoPrimaryKey(path.clone()));
                }
                for row in rows {
                    if row.len() != table.schema.fields.len() {
                        return Err(StoreError::InvalidRow(format!(
                            "expected {} columns, got {}",
                            table.schema.fields.len(),
                            row.len()
                        )));
                    }
                    let key = table.key_of(&row);
                    if let Some(i) = table.position_of(&key) {
                        let removed = table.rows.remove(i);
                        table.record(ChangeType::Delete, removed);
                    }
                }
                Ok(())
            })
        })
    }

    fn scan<'a>(&'a self, path: &'a TablePath, limit: usize) -> StoreFuture<'a, Vec<Row>> {
        Box::pin(async move {
            self.with_table(path, |table| Ok(table.rows.iter().take(limit).cloned().collect()))
        })
    }

    fn read_log<'a>(&'a self, path: &'a TablePath, from_offset: i64, max: usize) -> StoreFuture<'a, Vec<LogRecord>> {
        Box::pin(async move {
            self.with_table(path, |table| {
                let start = from_offset.max(0) as usize;
                Ok(table.log.iter().skip(start).take(max).cloned().collect())
            })
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            Ok(())
        })
    }
}

/// Connector handing out connections to one shared in-memory catalog
#[derive(Debug, Clone, Default)]
pub struct InMemoryConnector {
    store: InMemoryTableStore,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct handle on the catalog, for seeding data
    pub fn store(&self) -> InMemoryTableStore {
        self.store.reopen()
    }
}

impl Connector for InMemoryConnector {
    fn connect<'a>(&'a self, config: &'a ClientConfig) -> StoreFuture<'a, Arc<dyn TableStore>> {
        Box::pin(async move {
            config.validate()?;
            debug!("Connected to in-memory store via {:?}", config.bootstrap_servers);
            let store: Arc<dyn TableStore> = Arc::new(self.store.reopen());
            Ok(store)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Schema {
        Schema::new(
            vec![("id".into(), DataType::BigInt), ("name".into(), DataType::String)],
            vec!["id".into()],
        )
    }

    fn events() -> Schema {
        Schema::new(vec![("msg".into(), DataType::String)], vec![])
    }

    async fn store_with_tables() -> InMemoryTableStore {
        let store = InMemoryTableStore::new();
        store.create_database("db", Some("test")).await.unwrap();
        store.create_table(&TablePath::new("db", "users"), &users()).await.unwrap();
        store.create_table(&TablePath::new("db", "events"), &events()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_catalog_operations() {
        let store = store_with_tables().await;
        assert_eq!(store.list_databases().await.unwrap(), vec!["db"]);
        assert_eq!(store.list_tables("db").await.unwrap(), vec!["events", "users"]);
        assert_eq!(store.database_comment("db").as_deref(), Some("test"));

        assert_eq!(
            store.create_database("db", None).await,
            Err(StoreError::DatabaseAlreadyExists("db".into()))
        );
        assert_eq!(
            store.drop_database("db", false).await,
            Err(StoreError::DatabaseNotEmpty("db".into()))
        );
        store.drop_database("db", true).await.unwrap();
        assert!(!store.database_exists("db").await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key_and_logs_changes() {
        let store = store_with_tables().await;
        let path = TablePath::new("db", "users");

        store
            .upsert(&path, vec![vec![Datum::BigInt(1), Datum::String("a".into())]])
            .await
            .unwrap();
        store
            .upsert(&path, vec![vec![Datum::BigInt(1), Datum::String("b".into())]])
            .await
            .unwrap();

        let rows = store.scan(&path, 10).await.unwrap();
        assert_eq!(rows, vec![vec![Datum::BigInt(1), Datum::String("b".into())]]);

        let log = store.read_log(&path, 0, 10).await.unwrap();
        let kinds: Vec<ChangeType> = log.iter().map(|r| r.change_type).collect();
        assert_eq!(
            kinds,
            vec![ChangeType::Insert, ChangeType::UpdateBefore, ChangeType::UpdateAfter]
        );
        assert_eq!(log[2].offset, 2);

        store
            .delete(&path, vec![vec![Datum::BigInt(1), Datum::Null]])
            .await
            .unwrap();
        assert!(store.scan(&path, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_mode_checks() {
        let store = store_with_tables().await;
        let users = TablePath::new("db", "users");
        let events = TablePath::new("db", "events");

        assert!(store
            .append(&users, vec![vec![Datum::BigInt(1), Datum::Null]])
            .await
            .is_err());
        assert_eq!(
            store.upsert(&events, vec![vec![Datum::String("x".into())]]).await,
            Err(StoreError::NoPrimaryKey(events.clone()))
        );
        assert!(matches!(
            store.upsert(&users, vec![vec![Datum::Null, Datum::Null]]).await,
            Err(StoreError::InvalidRow(_))
        ));
        assert!(matches!(
            store.append(&events, vec![vec![Datum::Int(3)]]).await,
            Err(StoreError::InvalidRow(_))
        ));
    }

    #[tokio::test]
    async fn test_connections_share_catalog() {
        let connector = InMemoryConnector::new();
        let config = ClientConfig::with_bootstrap("localhost:9123");
        let a = connector.connect(&config).await.unwrap();
        let b = connector.connect(&config).await.unwrap();

        a.create_database("shared", None).await.unwrap();
        assert!(b.database_exists("shared").await.unwrap());

        a.close().await.unwrap();
        assert_eq!(a.list_databases().await, Err(StoreError::Closed));
        assert!(b.list_databases().await.is_ok());

        assert!(connector.connect(&ClientConfig::default()).await.is_err());
    }
}
