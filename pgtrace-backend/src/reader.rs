use crate::error::{PartialFetchError, StorageError};
use crate::reader::assembly::{assemble_trace, fetch_trace_spans};
use crate::reader::filter::{BindValue, SpanFilter};
use api_structs::{DependencyLink, Trace, TraceId, TraceQuery};
use async_trait::async_trait;
use futures::StreamExt;
use sqlx::{PgPool, Postgres};
use std::collections::{HashMap, HashSet};
use tracing::{info, instrument};

pub mod assembly;
pub mod dependencies;
pub mod filter;

/// The join against operations/services fans out to one row per matching
/// span, so a single trace can eat many rows of the fetch budget. Fetch this
/// many rows per requested trace before deduplicating to trace ids.
pub const TRACE_ID_FETCH_MULTIPLIER: i64 = 100;
/// Upper bound on per-trace span fetches running at once during find_traces.
pub const MAX_CONCURRENT_TRACE_FETCHES: usize = 8;

/// Read side of the span store.
///
/// Every method is a plain async fn: dropping the returned future stops any
/// further storage work, callers put a deadline on top with
/// `tokio::time::timeout` when they need one. In-flight statements are
/// abandoned, not force-aborted.
#[async_trait]
pub trait SpanReader {
    /// All known service names, sorted ascending, empty names excluded.
    async fn get_services(&self) -> Result<Vec<String>, PartialFetchError<String>>;
    /// All known operation names, sorted ascending, empty names excluded,
    /// optionally narrowed to the operations some service's spans reference.
    async fn get_operations(
        &self,
        service_name: Option<&str>,
    ) -> Result<Vec<String>, PartialFetchError<String>>;
    /// All spans sharing the given trace id pair, assembled into a single
    /// Trace. A trace id with no spans yields None, not an error.
    async fn get_trace(&self, trace_id: TraceId) -> Result<Option<Trace>, StorageError>;
    /// Distinct trace ids with at least one span matching the criteria,
    /// bounded by the query's num_traces (default 10).
    async fn find_trace_ids(&self, query: &TraceQuery) -> Result<Vec<TraceId>, StorageError>;
    /// find_trace_ids followed by one trace assembly per resolved id.
    async fn find_traces(&self, query: &TraceQuery) -> Result<Vec<Trace>, PartialFetchError<Trace>>;
    /// Parent->child service call counts over reference edges whose
    /// referencing span started within [end_ts - lookback, end_ts], nanos.
    async fn get_dependencies(
        &self,
        end_ts: u64,
        lookback: u64,
    ) -> Result<Vec<DependencyLink>, StorageError>;
}

/// Queries for and loads traces from PostgreSQL.
#[derive(Clone)]
pub struct PostgresReader {
    con: PgPool,
}

impl PostgresReader {
    pub fn new(con: PgPool) -> Self {
        Self { con }
    }
}

#[async_trait]
impl SpanReader for PostgresReader {
    #[instrument(skip_all)]
    async fn get_services(&self) -> Result<Vec<String>, PartialFetchError<String>> {
        let mut rows = sqlx::query_scalar::<Postgres, String>(
            "select service_name from services order by service_name asc",
        )
        .fetch(&self.con);
        let mut services: Vec<String> = Vec::new();
        while let Some(row) = rows.next().await {
            match row {
                Ok(name) => {
                    if !name.is_empty() {
                        services.push(name);
                    }
                }
                Err(e) => {
                    return Err(PartialFetchError {
                        partial: services,
                        source: StorageError::from_sqlx_error(e, "listing service names"),
                    });
                }
            }
        }
        Ok(services)
    }

    #[instrument(skip_all)]
    async fn get_operations(
        &self,
        service_name: Option<&str>,
    ) -> Result<Vec<String>, PartialFetchError<String>> {
        let mut rows = match service_name {
            Some(service) => sqlx::query_scalar::<Postgres, String>(
                "select distinct operation.operation_name
from spans as span
         join operations as operation on operation.id = span.operation_id
         join services as service on service.id = span.service_id
where service.service_name = $1
order by operation.operation_name asc",
            )
            .bind(service.to_string())
            .fetch(&self.con),
            None => sqlx::query_scalar::<Postgres, String>(
                "select operation_name from operations order by operation_name asc",
            )
            .fetch(&self.con),
        };
        let mut operations: Vec<String> = Vec::new();
        while let Some(row) = rows.next().await {
            match row {
                Ok(name) => {
                    if !name.is_empty() {
                        operations.push(name);
                    }
                }
                Err(e) => {
                    return Err(PartialFetchError {
                        partial: operations,
                        source: StorageError::from_sqlx_error(
                            e,
                            format!("listing operation names for {service_name:?}"),
                        ),
                    });
                }
            }
        }
        Ok(operations)
    }

    #[instrument(skip_all, fields(trace_id = %trace_id))]
    async fn get_trace(&self, trace_id: TraceId) -> Result<Option<Trace>, StorageError> {
        let rows = fetch_trace_spans(&self.con, trace_id).await?;
        info!("got {} span rows", rows.len());
        assemble_trace(rows)
    }

    #[instrument(skip_all)]
    async fn find_trace_ids(&self, query: &TraceQuery) -> Result<Vec<TraceId>, StorageError> {
        let filter = SpanFilter::from_query(query)?;
        let limit = query.effective_num_traces();
        let sql = find_trace_ids_sql(&filter);
        let mut db_query = sqlx::query_as::<Postgres, RawTraceIdRow>(&sql);
        for param in filter.params() {
            db_query = match param {
                BindValue::Text(value) => db_query.bind(value.clone()),
                BindValue::BigInt(value) => db_query.bind(*value),
            };
        }
        db_query = db_query.bind(limit.saturating_mul(TRACE_ID_FETCH_MULTIPLIER));
        let rows = db_query.fetch_all(&self.con).await.map_err(|e| {
            StorageError::from_sqlx_error(e, format!("finding trace ids matching {query:?}"))
        })?;
        let trace_ids = dedup_trace_ids(rows, limit);
        info!("found {} distinct trace ids", trace_ids.len());
        Ok(trace_ids)
    }

    #[instrument(skip_all)]
    async fn find_traces(&self, query: &TraceQuery) -> Result<Vec<Trace>, PartialFetchError<Trace>> {
        let trace_ids = self
            .find_trace_ids(query)
            .await
            .map_err(|source| PartialFetchError {
                partial: Vec::new(),
                source,
            })?;
        // Per-trace fetches are independent, run them concurrently with each
        // one checking its own connection out of the pool. This single task
        // is the only writer of the id -> trace map.
        let fetches: Vec<_> = trace_ids
            .iter()
            .map(|&trace_id| {
                let con = self.con.clone();
                async move {
                    let rows = fetch_trace_spans(&con, trace_id).await?;
                    Ok::<_, StorageError>((trace_id, rows))
                }
            })
            .collect();
        let mut fetches = futures::stream::iter(fetches).buffer_unordered(MAX_CONCURRENT_TRACE_FETCHES);
        let mut assembled: HashMap<TraceId, Trace> = HashMap::new();
        while let Some(fetched) = fetches.next().await {
            let assembly = fetched
                .and_then(|(trace_id, rows)| Ok((trace_id, assemble_trace(rows)?)));
            match assembly {
                Ok((trace_id, Some(trace))) => {
                    assembled.insert(trace_id, trace);
                }
                // a trace id with zero spans simply contributes no trace
                Ok((_, None)) => {}
                Err(source) => {
                    // dropping the stream cancels the outstanding fetches
                    drop(fetches);
                    let partial = trace_ids
                        .iter()
                        .filter_map(|id| assembled.remove(id))
                        .collect();
                    return Err(PartialFetchError { partial, source });
                }
            }
        }
        info!("assembled {} traces", assembled.len());
        Ok(trace_ids
            .into_iter()
            .filter_map(|id| assembled.remove(&id))
            .collect())
    }

    #[instrument(skip_all)]
    async fn get_dependencies(
        &self,
        end_ts: u64,
        lookback: u64,
    ) -> Result<Vec<DependencyLink>, StorageError> {
        let window_end = nanos_to_db_i64(end_ts, "dependency window end")?;
        let window_start = nanos_to_db_i64(
            end_ts.saturating_sub(lookback),
            "dependency window start",
        )?;
        let edges = dependencies::fetch_reference_edges(&self.con, window_start, window_end).await?;
        info!("got {} reference edges in window", edges.len());
        Ok(dependencies::count_dependency_links(edges))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RawTraceIdRow {
    trace_id_high: i64,
    trace_id_low: i64,
}

fn find_trace_ids_sql(filter: &SpanFilter) -> String {
    let mut sql = String::from(
        "select span.trace_id_high, span.trace_id_low
from spans as span
         join operations as operation on operation.id = span.operation_id
         join services as service on service.id = span.service_id",
    );
    let predicate = filter.render();
    if !predicate.is_empty() {
        sql.push('\n');
        sql.push_str(&predicate);
    }
    sql.push_str(&format!("\nlimit ${}", filter.param_count() + 1));
    sql
}

/// The join produces row-level matches, one per span, so the same trace id
/// pair shows up once per matching span. Collapse to distinct ids keeping
/// first-seen order, then truncate to the requested count.
fn dedup_trace_ids(rows: Vec<RawTraceIdRow>, limit: i64) -> Vec<TraceId> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let mut seen: HashSet<TraceId> = HashSet::new();
    let mut trace_ids: Vec<TraceId> = Vec::new();
    for row in rows {
        let trace_id = TraceId::from_db(row.trace_id_high, row.trace_id_low);
        if seen.insert(trace_id) {
            trace_ids.push(trace_id);
            if trace_ids.len() == limit {
                break;
            }
        }
    }
    trace_ids
}

pub(crate) fn nanos_to_db_i64(nanos: u64, context: &str) -> Result<i64, StorageError> {
    i64::try_from(nanos).map_err(|_| StorageError::OutOfRange {
        value: nanos,
        context: context.to_string(),
    })
}
