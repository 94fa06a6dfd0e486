//! Wire method table for [`FlussBridge`]
//!
//! Arguments are positional; trailing optional arguments may be omitted or
//! passed as `null`. Argument shape errors are protocol errors and reach the
//! peer as `err` outcomes. Everything past that is the facade's business.

use super::facade::FlussBridge;
use super::schema::Record;
use crate::gateway::{Args, CallError, CallResult, GatewayObject, Returned};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

fn value(v: impl Into<Value>) -> CallResult {
    Ok(Returned::Value(v.into()))
}

impl GatewayObject for FlussBridge {
    fn invoke<'a>(&'a self, method: &'a str, args: Args) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            match method {
                // Connection
                "connect" => {
                    args.expect_at_most(1)?;
                    value(self.connect(&args.get::<String>(0)?).await)
                }
                "connect_with_config" => {
                    args.expect_at_most(1)?;
                    let options: BTreeMap<String, String> = args.get(0)?;
                    value(self.connect_with_config(options).await)
                }
                "is_connected" => {
                    args.expect_at_most(0)?;
                    value(self.is_connected())
                }
                "close" => {
                    args.expect_at_most(0)?;
                    self.close().await;
                    Ok(Returned::unit())
                }
                "connection_info" => {
                    args.expect_at_most(0)?;
                    value(self.connection_info().await)
                }

                // Databases
                "create_database" => {
                    args.expect_at_most(2)?;
                    let comment: Option<String> = args.opt(1)?;
                    value(self.create_database(&args.get::<String>(0)?, comment.as_deref()).await)
                }
                "drop_database" => {
                    args.expect_at_most(1)?;
                    value(self.drop_database(&args.get::<String>(0)?).await)
                }
                "database_exists" => {
                    args.expect_at_most(1)?;
                    value(self.database_exists(&args.get::<String>(0)?).await)
                }
                "list_databases" => {
                    args.expect_at_most(0)?;
                    value(self.list_databases().await)
                }
                "database_info" => {
                    args.expect_at_most(1)?;
                    value(self.database_info(&args.get::<String>(0)?).await)
                }

                // Tables
                "list_tables" => {
                    args.expect_at_most(1)?;
                    value(self.list_tables(&args.get::<String>(0)?).await)
                }
                "table_exists" => {
                    let (db, table) = table_args(&args, 2)?;
                    value(self.table_exists(&db, &table).await)
                }
                "create_table" => {
                    args.expect_at_most(5)?;
                    let (db, table) = table_args(&args, 5)?;
                    let names: Vec<String> = args.get(2)?;
                    let types: Vec<String> = args.get(3)?;
                    let keys: Vec<String> = args.opt(4)?.unwrap_or_default();
                    value(self.create_table(&db, &table, &names, &types, &keys).await)
                }
                "create_simple_table" => {
                    let (db, table) = table_args(&args, 2)?;
                    value(self.create_simple_table(&db, &table).await)
                }
                "drop_table" => {
                    let (db, table) = table_args(&args, 2)?;
                    value(self.drop_table(&db, &table).await)
                }
                "table_schema" => {
                    let (db, table) = table_args(&args, 2)?;
                    value(Value::Object(self.table_schema(&db, &table).await))
                }
                "table_fields" => {
                    let (db, table) = table_args(&args, 2)?;
                    value(self.table_fields(&db, &table).await)
                }

                // Writes
                "upsert_record" | "append_record" | "delete_record" => {
                    let (db, table) = table_args(&args, 3)?;
                    let record: Record = args.get(2)?;
                    let ok = match method {
                        "upsert_record" => self.upsert_record(&db, &table, &record).await,
                        "append_record" => self.append_record(&db, &table, &record).await,
                        _ => self.delete_record(&db, &table, &record).await,
                    };
                    value(ok)
                }
                "append_data" | "insert_data" => {
                    let (db, table) = table_args(&args, 3)?;
                    let records: Vec<Record> = args.get(2)?;
                    let ok = if method == "append_data" {
                        self.append_data(&db, &table, &records).await
                    } else {
                        self.insert_data(&db, &table, &records).await
                    };
                    value(ok)
                }
                "flush_all_writers" => {
                    args.expect_at_most(0)?;
                    self.flush_all_writers().await;
                    Ok(Returned::unit())
                }
                "close_all_writers" => {
                    args.expect_at_most(0)?;
                    self.close_all_writers().await;
                    Ok(Returned::unit())
                }
                "writer_stats" => {
                    args.expect_at_most(0)?;
                    value(json!(self.writer_stats()))
                }

                // Reads
                "create_scan_reader" => {
                    let (db, table) = table_args(&args, 4)?;
                    let scan_type: Option<String> = args.opt(2)?;
                    let limit: Option<usize> = args.opt(3)?;
                    let reader = self
                        .create_scan_reader(&db, &table, scan_type.as_deref(), limit)
                        .await;
                    Ok(reader_handle(reader))
                }
                "create_lookup_reader" => {
                    let (db, table) = table_args(&args, 2)?;
                    Ok(reader_handle(self.create_lookup_reader(&db, &table).await))
                }
                "create_log_reader" => {
                    let (db, table) = table_args(&args, 2)?;
                    Ok(reader_handle(self.create_log_reader(&db, &table).await))
                }
                "read_table_data" => {
                    let (db, table) = table_args(&args, 3)?;
                    let max: Option<usize> = args.opt(2)?;
                    let records = self.read_table_data(&db, &table, max).await;
                    value(records.into_iter().map(Value::Object).collect::<Vec<_>>())
                }
                "is_table_empty" => {
                    let (db, table) = table_args(&args, 2)?;
                    value(self.is_table_empty(&db, &table).await)
                }
                "check_table_health" => {
                    let (db, table) = table_args(&args, 2)?;
                    value(Value::Object(self.check_table_health(&db, &table).await))
                }

                other => Err(CallError::UnknownMethod(other.to_string())),
            }
        })
    }
}

/// Leading `(database, table)` pair, with an upper bound on the argument count
fn table_args(args: &Args, max: usize) -> Result<(String, String), CallError> {
    args.expect_at_most(max)?;
    Ok((args.get(0)?, args.get(1)?))
}

fn reader_handle<T: GatewayObject>(reader: Option<T>) -> Returned {
    match reader {
        Some(reader) => Returned::Object(Arc::new(reader)),
        None => Returned::unit(),
    }
}
