//! Table readers handed to the peer as object handles

use super::schema::{log_record_to_record, row_to_record, Record};
use super::store::{StoreError, TableStore};
use super::types::{ScanKind, Schema, TablePath};
use crate::gateway::{Args, CallError, CallResult, GatewayObject, Returned};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Row limit for bounded scans when the caller gives none
pub const SCAN_LIMIT_DEFAULT: usize = 1000;

#[derive(Debug, Default)]
struct Cursor {
    /// Rows already returned from a bounded scan
    consumed: usize,
    /// Next changelog offset for log scans
    log_offset: i64,
    records_read: u64,
    closed: bool,
}

pub struct TableReader {
    path: TablePath,
    kind: ScanKind,
    limit: usize,
    schema: Schema,
    store: Arc<dyn TableStore>,
    cursor: Mutex<Cursor>,
}

impl TableReader {
    pub fn new(store: Arc<dyn TableStore>, path: TablePath, schema: Schema, kind: ScanKind, limit: usize) -> Self {
        debug_assert!(limit > 0, "scan limit must be positive");
        debug!("Opened {} reader on {} (limit {})", kind.name(), path, limit);
        TableReader {
            path,
            kind,
            limit,
            schema,
            store,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.lock().closed
    }

    /// Next batch of at most `max_records` records; empty on failure
    pub async fn read_records(&self, max_records: usize) -> Vec<Record> {
        match self.try_read(max_records).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Read from {} failed: {}", self.path, e);
                Vec::new()
            }
        }
    }

    async fn try_read(&self, max_records: usize) -> Result<Vec<Record>, StoreError> {
        let (consumed, offset) = {
            let cursor = self.cursor.lock();
            if cursor.closed {
                warn!("Read from closed {} reader on {}", self.kind.name(), self.path);
                return Ok(Vec::new());
            }
            (cursor.consumed, cursor.log_offset)
        };
        if max_records == 0 {
            return Ok(Vec::new());
        }

        let records = match self.kind {
            ScanKind::Snapshot | ScanKind::Lookup => {
                let rows = self.store.scan(&self.path, self.limit).await?;
                let records: Vec<Record> = rows
                    .iter()
                    .skip(consumed)
                    .take(max_records)
                    .enumerate()
                    .map(|(i, row)| row_to_record(&self.schema, row, i))
                    .collect();
                self.cursor.lock().consumed += records.len();
                records
            }
            ScanKind::Log => {
                let log = self.store.read_log(&self.path, offset, max_records).await?;
                if let Some(last) = log.last() {
                    self.cursor.lock().log_offset = last.offset + 1;
                }
                log.iter()
                    .enumerate()
                    .map(|(i, entry)| log_record_to_record(&self.schema, entry, i))
                    .collect()
            }
        };

        self.cursor.lock().records_read += records.len() as u64;
        debug!("Read {} records from {}", records.len(), self.path);
        Ok(records)
    }

    pub fn status(&self) -> Value {
        let cursor = self.cursor.lock();
        json!({
            "table": self.path.to_string(),
            "scan_type": self.kind.name(),
            "limit": self.limit,
            "records_read": cursor.records_read,
            "log_offset": cursor.log_offset,
            "closed": cursor.closed,
        })
    }

    pub fn close(&self) {
        let mut cursor = self.cursor.lock();
        if !cursor.closed {
            cursor.closed = true;
            debug!("Closed reader on {}", self.path);
        }
    }
}

impl GatewayObject for TableReader {
    fn invoke<'a>(&'a self, method: &'a str, args: Args) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            match method {
                "read_records" => {
                    args.expect_at_most(1)?;
                    let max = args.opt::<usize>(0)?.unwrap_or(SCAN_LIMIT_DEFAULT);
                    let records = self.read_records(max).await;
                    Ok(Returned::Value(Value::Array(
                        records.into_iter().map(Value::Object).collect(),
                    )))
                }
                "status" => {
                    args.expect_at_most(0)?;
                    Ok(Returned::Value(self.status()))
                }
                "close" => {
                    args.expect_at_most(0)?;
                    self.close();
                    Ok(Returned::unit())
                }
                other => Err(CallError::UnknownMethod(other.to_string())),
            }
        })
    }
}
