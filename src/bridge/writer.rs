//! Per-table writer cache
//!
//! One writer per (table, mode). Writers buffer changes and push them to the
//! store on flush, in the order they were written. The cache is shared by
//! every concurrent call on the bridge.
//!
//! A call that needs its own result uses [`TableWriter::write_rows`], which
//! sends exactly that call's rows. Sends on one writer never interleave.

use super::store::{StoreError, TableStore};
use super::types::{Row, Schema, TablePath};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// Primary key table: upserts and deletes
    Upsert,
    /// Log table: appends only
    Append,
}

impl WriteMode {
    pub fn name(self) -> &'static str {
        match self {
            WriteMode::Upsert => "upsert",
            WriteMode::Append => "append",
        }
    }
}

#[derive(Debug)]
enum Change {
    Put(Row),
    Delete(Row),
}

#[derive(Debug)]
pub struct TableWriter {
    path: TablePath,
    mode: WriteMode,
    schema: Schema,
    pending: Mutex<Vec<Change>>,
    /// Held across every send so batches reach the store whole and in order
    send_lock: tokio::sync::Mutex<()>,
    rows_written: AtomicU64,
}

impl TableWriter {
    fn new(path: TablePath, mode: WriteMode, schema: Schema) -> Self {
        TableWriter {
            path,
            mode,
            schema,
            pending: Mutex::new(Vec::new()),
            send_lock: tokio::sync::Mutex::new(()),
            rows_written: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &TablePath {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn write(&self, row: Row) {
        self.pending.lock().push(Change::Put(row));
    }

    pub fn delete(&self, row: Row) {
        debug_assert_eq!(self.mode, WriteMode::Upsert, "deletes need a primary key table");
        self.pending.lock().push(Change::Delete(row));
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    /// Send `rows` straight to the store, bypassing the buffer.
    ///
    /// Only these rows are written, so the result belongs to the caller
    /// alone. Returns how many were written.
    pub async fn write_rows(&self, store: &dyn TableStore, rows: Vec<Row>, delete: bool) -> Result<usize, StoreError> {
        debug_assert!(!delete || self.mode == WriteMode::Upsert, "deletes need a primary key table");
        if rows.is_empty() {
            return Ok(0);
        }
        let _guard = self.send_lock.lock().await;
        self.send(store, rows, delete).await
    }

    /// Push buffered changes; returns how many were written.
    ///
    /// Consecutive changes of the same kind go out as one batch. On error the
    /// unsent changes are dropped along with the failed batch.
    pub async fn flush(&self, store: &dyn TableStore) -> Result<usize, StoreError> {
        let _guard = self.send_lock.lock().await;
        let changes = std::mem::take(&mut *self.pending.lock());
        if changes.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut batch: Vec<Row> = Vec::new();
        let mut batch_is_delete = false;

        for change in changes {
            let (row, is_delete) = match change {
                Change::Put(row) => (row, false),
                Change::Delete(row) => (row, true),
            };
            if !batch.is_empty() && is_delete != batch_is_delete {
                written += self.send(store, std::mem::take(&mut batch), batch_is_delete).await?;
            }
            batch_is_delete = is_delete;
            batch.push(row);
        }
        if !batch.is_empty() {
            written += self.send(store, batch, batch_is_delete).await?;
        }

        debug!("Flushed {} changes to {}", written, self.path);
        Ok(written)
    }

    async fn send(&self, store: &dyn TableStore, rows: Vec<Row>, is_delete: bool) -> Result<usize, StoreError> {
        let n = rows.len();
        match (self.mode, is_delete) {
            (_, true) => store.delete(&self.path, rows).await?,
            (WriteMode::Upsert, false) => store.upsert(&self.path, rows).await?,
            (WriteMode::Append, false) => store.append(&self.path, rows).await?,
        }
        self.rows_written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[derive(Debug, Default)]
pub struct WriterCache {
    writers: RwLock<HashMap<(TablePath, WriteMode), Arc<TableWriter>>>,
}

impl WriterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached writer for `path`/`mode`, created with `schema` if absent
    pub fn writer(&self, path: &TablePath, mode: WriteMode, schema: &Schema) -> Arc<TableWriter> {
        let key = (path.clone(), mode);
        if let Some(writer) = self.writers.read().get(&key) {
            return writer.clone();
        }
        self.writers
            .write()
            .entry(key)
            .or_insert_with(|| {
                debug!("Created {} writer for {}", mode.name(), path);
                Arc::new(TableWriter::new(path.clone(), mode, schema.clone()))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.writers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<TableWriter>> {
        self.writers.read().values().cloned().collect()
    }

    /// Flush every writer; keeps going past failures and reports the first
    pub async fn flush_all(&self, store: &dyn TableStore) -> Result<usize, StoreError> {
        let mut total = 0;
        let mut first_error = None;
        for writer in self.snapshot() {
            match writer.flush(store).await {
                Ok(n) => total += n,
                Err(e) => {
                    warn!("Failed to flush writer for {}: {}", writer.path(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Flush and drop every writer
    pub async fn close_all(&self, store: &dyn TableStore) -> Result<usize, StoreError> {
        let result = self.flush_all(store).await;
        self.writers.write().clear();
        result
    }

    /// Forget writers for a dropped table without flushing
    pub fn remove_table(&self, path: &TablePath) {
        self.writers.write().retain(|(p, _), _| p != path);
    }

    pub fn clear(&self) {
        self.writers.write().clear();
    }

    /// Rows written per writer, keyed `db.table/mode`
    pub fn stats(&self) -> BTreeMap<String, u64> {
        self.writers
            .read()
            .iter()
            .map(|((path, mode), w)| (format!("{}/{}", path, mode.name()), w.rows_written()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::memory::InMemoryTableStore;
    use crate::bridge::types::{DataType, Datum};

    fn users() -> Schema {
        Schema::new(
            vec![("id".into(), DataType::BigInt), ("name".into(), DataType::String)],
            vec!["id".into()],
        )
    }

    fn row(id: i64, name: &str) -> Row {
        vec![Datum::BigInt(id), Datum::String(name.into())]
    }

    async fn store() -> (InMemoryTableStore, TablePath) {
        let store = InMemoryTableStore::new();
        let path = TablePath::new("db", "users");
        store.create_database("db", None).await.unwrap();
        store.create_table(&path, &users()).await.unwrap();
        (store, path)
    }

    #[tokio::test]
    async fn test_writer_is_cached_per_table_and_mode() {
        let cache = WriterCache::new();
        let path = TablePath::new("db", "users");
        let a = cache.writer(&path, WriteMode::Upsert, &users());
        let b = cache.writer(&path, WriteMode::Upsert, &users());
        assert!(Arc::ptr_eq(&a, &b));
        cache.writer(&path, WriteMode::Append, &users());
        assert_eq!(cache.len(), 2);

        cache.remove_table(&path);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_flush_preserves_order_of_puts_and_deletes() {
        let (store, path) = store().await;
        let cache = WriterCache::new();
        let writer = cache.writer(&path, WriteMode::Upsert, &users());

        writer.write(row(1, "a"));
        writer.write(row(2, "b"));
        writer.delete(row(1, ""));
        writer.write(row(1, "c"));
        assert_eq!(writer.pending(), 4);

        assert_eq!(cache.flush_all(&store).await.unwrap(), 4);
        assert_eq!(writer.pending(), 0);

        let rows = store.scan(&path, 10).await.unwrap();
        assert_eq!(rows, vec![row(2, "b"), row(1, "c")]);
        assert_eq!(cache.stats().get("db.users/upsert"), Some(&4));
    }

    #[tokio::test]
    async fn test_write_rows_sends_only_its_own_rows() {
        let (store, path) = store().await;
        let cache = WriterCache::new();
        let writer = cache.writer(&path, WriteMode::Upsert, &users());

        // Someone else's buffered change, with a null primary key
        writer.write(vec![Datum::Null, Datum::String("bad".into())]);

        assert_eq!(writer.write_rows(&store, vec![row(1, "a"), row(2, "b")], false).await.unwrap(), 2);
        assert_eq!(writer.pending(), 1);
        assert_eq!(store.scan(&path, 10).await.unwrap(), vec![row(1, "a"), row(2, "b")]);

        assert_eq!(writer.write_rows(&store, vec![row(1, "")], true).await.unwrap(), 1);
        assert_eq!(store.scan(&path, 10).await.unwrap(), vec![row(2, "b")]);

        // The bad change fails its own flush, not the writes above
        assert!(writer.flush(&store).await.is_err());
        assert_eq!(writer.rows_written(), 3);
    }

    #[tokio::test]
    async fn test_close_all_reports_failure_and_clears() {
        let (store, path) = store().await;
        let cache = WriterCache::new();
        let writer = cache.writer(&path, WriteMode::Append, &users());
        writer.write(row(1, "a"));

        // Appends to a primary key table are rejected by the store
        assert!(cache.close_all(&store).await.is_err());
        assert!(cache.is_empty());
    }
}
