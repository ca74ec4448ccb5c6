//! Parallel PostgreSQL source sharded through a materialised view.
//!
//! Opening the source creates a materialised view holding, for every row of
//! the configured table matching the predicate, a dense row number, the row
//! number modulo the worker count, and the primary key columns. Each worker
//! owns one residue class of the modulo and pages through its shard in row
//! number order, so every row is delivered exactly once without requiring a
//! numeric primary key. The view and its index are dropped on close.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use deadpool_postgres::{ManagerConfig, Pool, RecyclingMethod, Runtime};
use indexmap::IndexMap;
use serde_json::Value;
use snafu::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row, Statement};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{DatabaseSourceConfig, DbClientConfig};
use crate::error::{
    AcquireConnectionSnafu, CreatePoolSnafu, DecodeColumnSnafu, QuerySnafu, SourceError,
};
use crate::source::DataSource;
use crate::source::query::{
    VIEW_NAME, VIEW_ROW_NUM, count_view_sql, create_view_index_sql, create_view_sql,
    drop_view_sql, qualify_selected_columns, shard_page_sql, strip_where_prefix,
};
use crate::types::{Payload, ProgressWatch, Record};

/// Connection pool cap; generous so `parallel` workers never starve.
const MAX_POOL_SIZE: usize = 64;

pub struct DatabaseSource {
    pool: Option<Pool>,
    rows: mpsc::Receiver<Payload>,
    errors: mpsc::Receiver<SourceError>,
    watch: ProgressWatch,
}

impl DatabaseSource {
    pub async fn open(
        cfg: &DatabaseSourceConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, SourceError> {
        let pool = create_pool(&cfg.client)?;

        let selected_columns = qualify_selected_columns(&cfg.table, &cfg.selected_columns);
        let where_clause = strip_where_prefix(&cfg.where_clause).to_string();

        let client = pool.get().await.context(AcquireConnectionSnafu)?;

        let create_view = create_view_sql(&cfg.table, &where_clause, &cfg.primary_key, cfg.parallel);
        info!(query = %create_view, "creating materialized view");
        client.execute(create_view.as_str(), &[]).await.context(QuerySnafu {
            context: "create materialized view".to_string(),
        })?;

        let create_index = create_view_index_sql();
        info!(query = %create_index, "creating view index");
        client.execute(create_index.as_str(), &[]).await.context(QuerySnafu {
            context: "create view index".to_string(),
        })?;

        let count_query = count_view_sql();
        info!(query = %count_query, "selecting rows count");
        let count_row = client.query_one(count_query.as_str(), &[]).await.context(QuerySnafu {
            context: "select view rows count".to_string(),
        })?;
        let rows_count: i64 = count_row.try_get(0).context(DecodeColumnSnafu {
            column: "count".to_string(),
        })?;
        info!("rows count of {VIEW_NAME}: {rows_count}");
        drop(client);

        let capacity = (cfg.batch_size as usize).saturating_mul(cfg.parallel).max(1);
        let (row_tx, row_rx) = mpsc::channel(capacity);
        let (err_tx, err_rx) = mpsc::channel(1);
        let watch = ProgressWatch::rows(rows_count as f64);

        spawn_fetch(
            pool.clone(),
            shard_page_sql(&cfg.table, &selected_columns, &cfg.primary_key, cfg.batch_size),
            cfg.parallel,
            row_tx,
            err_tx,
            shutdown,
        );

        Ok(Self {
            pool: Some(pool),
            rows: row_rx,
            errors: err_rx,
            watch,
        })
    }
}

#[async_trait]
impl DataSource for DatabaseSource {
    async fn next(&mut self) -> Result<Option<Payload>, SourceError> {
        match self.rows.recv().await {
            Some(payload) => {
                self.watch.record_read();
                Ok(Some(payload))
            }
            // channel is closed only after the fan-out queued any error
            None => match self.errors.try_recv() {
                Ok(err) => Err(err),
                Err(_) => Ok(None),
            },
        }
    }

    fn watch(&self) -> ProgressWatch {
        self.watch.clone()
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        let Some(pool) = self.pool.take() else {
            return Ok(());
        };

        let drop_query = drop_view_sql();
        info!(query = %drop_query, "dropping materialized view");
        match pool.get().await {
            Ok(client) => {
                if let Err(err) = client.execute(drop_query.as_str(), &[]).await {
                    error!("failed to drop materialized view: {err}");
                }
            }
            Err(err) => error!("failed to acquire connection for view drop: {err}"),
        }

        pool.close();
        Ok(())
    }
}

fn create_pool(cfg: &DbClientConfig) -> Result<Pool, SourceError> {
    let mut pool_cfg = deadpool_postgres::Config::new();
    pool_cfg.host = Some(cfg.host.clone());
    pool_cfg.port = Some(cfg.port);
    pool_cfg.dbname = Some(cfg.database.clone());
    pool_cfg.user = Some(cfg.username.clone());
    pool_cfg.password = Some(cfg.password.clone());
    if let Some(schema) = &cfg.schema {
        pool_cfg.options = Some(format!("-c search_path={schema},public"));
    }
    pool_cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    pool_cfg.pool = Some(deadpool_postgres::PoolConfig::new(MAX_POOL_SIZE));

    pool_cfg
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .context(CreatePoolSnafu)
}

/// Start the shard workers and the task that joins them.
///
/// The fan-out task keeps a sender clone alive until any first error has
/// been queued, so the driver can never observe a closed data channel with
/// an unreported error still in flight.
fn spawn_fetch(
    pool: Pool,
    page_sql: String,
    parallel: usize,
    row_tx: mpsc::Sender<Payload>,
    err_tx: mpsc::Sender<SourceError>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let cancel = shutdown.child_token();
        let mut workers = JoinSet::new();
        for worker_idx in 0..parallel {
            workers.spawn(fetch_shard(
                pool.clone(),
                page_sql.clone(),
                worker_idx as i64,
                row_tx.clone(),
                cancel.clone(),
            ));
        }

        let mut first_error: Option<SourceError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(SourceError::WorkerJoin { source: err }));
            if let Err(err) = result {
                if first_error.is_none() {
                    cancel.cancel();
                    first_error = Some(err);
                } else {
                    debug!("dropping subsequent worker error: {err}");
                }
            }
        }

        if let Some(err) = first_error {
            let _ = err_tx.try_send(err);
        }
        drop(row_tx);
    });
}

/// Page through one shard until an empty page ends it.
async fn fetch_shard(
    pool: Pool,
    page_sql: String,
    worker_idx: i64,
    rows: mpsc::Sender<Payload>,
    cancel: CancellationToken,
) -> Result<(), SourceError> {
    let client = pool.get().await.context(AcquireConnectionSnafu)?;
    let statement = client.prepare(&page_sql).await.context(QuerySnafu {
        context: format!("prepare shard page for worker {worker_idx}"),
    })?;

    let mut max_row_num = 0i64;
    loop {
        let params: [&(dyn ToSql + Sync); 2] = [&worker_idx, &max_row_num];
        let page = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = client.query(&statement, &params) => {
                result.context(QuerySnafu {
                    context: format!("select shard page for worker {worker_idx}"),
                })?
            }
        };
        if page.is_empty() {
            debug!("worker {worker_idx} drained its shard at row {max_row_num}");
            return Ok(());
        }

        let column_types = column_types(&statement);
        for row in &page {
            let (row_num, data) = decode_row(row, &column_types)?;
            max_row_num = max_row_num.max(row_num);

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = rows.send(Payload::new(Record::Map(data))) => {
                    if sent.is_err() {
                        // receiver dropped, the source is closing
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Column names and type names, captured once per page query.
fn column_types(statement: &Statement) -> Vec<(String, String)> {
    statement
        .columns()
        .iter()
        .map(|column| (column.name().to_string(), column.type_().name().to_string()))
        .collect()
}

/// Decode one row into the synthetic row number and the column map.
///
/// Column 0 is always the view's row number; it feeds the worker's
/// high-water mark and never appears in the payload.
fn decode_row(
    row: &Row,
    column_types: &[(String, String)],
) -> Result<(i64, IndexMap<String, Value>), SourceError> {
    let row_num: i64 = row.try_get(0).context(DecodeColumnSnafu {
        column: VIEW_ROW_NUM.to_string(),
    })?;

    let mut data = IndexMap::with_capacity(column_types.len().saturating_sub(1));
    for (idx, (name, type_name)) in column_types.iter().enumerate().skip(1) {
        data.insert(name.clone(), decode_value(row, idx, name, type_name)?);
    }
    Ok((row_num, data))
}

/// Decode a single column into a JSON value.
///
/// JSONB/JSON columns decode through `serde_json::Value` directly; types
/// without a native binary decoding fall back to text extraction and
/// surface an error naming the type when even that fails.
fn decode_value(
    row: &Row,
    idx: usize,
    column: &str,
    type_name: &str,
) -> Result<Value, SourceError> {
    let decoded = match type_name {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .map(|v| v.map(Value::from)),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .map(|v| v.map(Value::from)),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .map(|v| v.map(Value::from)),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .map(|v| v.map(Value::from)),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .map(|v| v.map(|f| Value::from(f64::from(f)))),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .map(|v| v.map(Value::from)),
        "text" | "varchar" | "bpchar" | "name" | "unknown" => row
            .try_get::<_, Option<String>>(idx)
            .map(|v| v.map(Value::String)),
        "json" | "jsonb" => row.try_get::<_, Option<Value>>(idx),
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .map(|v| v.map(|u| Value::String(u.to_string()))),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map(|v| v.map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map(|v| v.map(|t| Value::String(t.to_rfc3339()))),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .map(|v| v.map(|b| Value::String(BASE64.encode(b)))),
        _ => {
            return row
                .try_get::<_, Option<String>>(idx)
                .map(|v| v.map(Value::String).unwrap_or(Value::Null))
                .map_err(|_| SourceError::UnsupportedColumn {
                    column: column.to_string(),
                    type_name: type_name.to_string(),
                });
        }
    };

    decoded
        .map(|v| v.unwrap_or(Value::Null))
        .context(DecodeColumnSnafu {
            column: column.to_string(),
        })
}

