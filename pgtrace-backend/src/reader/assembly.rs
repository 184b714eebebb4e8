use crate::error::StorageError;
use api_structs::{Process, ProcessMapping, Span, SpanRef, Trace, TraceId};
use sqlx::types::JsonValue;
use sqlx::{PgPool, Postgres};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RawSpanRow {
    pub id: i64,
    pub trace_id_high: i64,
    pub trace_id_low: i64,
    pub operation_name: String,
    pub service_name: String,
    pub process_id: String,
    pub process_tags: JsonValue,
    pub start_time: i64,
    pub duration: i64,
    pub child_span_ids: Vec<i64>,
}

pub(crate) async fn fetch_trace_spans(
    con: &PgPool,
    trace_id: TraceId,
) -> Result<Vec<RawSpanRow>, StorageError> {
    let (trace_id_high, trace_id_low) = trace_id.to_db();
    sqlx::query_as::<Postgres, RawSpanRow>(
        "select span.id,
       span.trace_id_high,
       span.trace_id_low,
       operation.operation_name,
       service.service_name,
       span.process_id,
       span.process_tags,
       span.start_time,
       span.duration,
       coalesce(span_ref.child_span_ids, '{}'::bigint[]) as child_span_ids
from spans as span
         join operations as operation on operation.id = span.operation_id
         join services as service on service.id = span.service_id
         left join (select id, array_agg(child_span_id) as child_span_ids
                    from span_refs
                    group by id) as span_ref on span_ref.id = span.id
where span.trace_id_low = $1
  and span.trace_id_high = $2
order by span.start_time asc",
    )
    .bind(trace_id_low)
    .bind(trace_id_high)
    .fetch_all(con)
    .await
    .map_err(|e| StorageError::from_sqlx_error(e, format!("fetching spans of trace {trace_id}")))
}

/// Builds the Trace aggregate out of the flat span rows. The process map gets
/// one entry per distinct process id, the first-seen mapping wins, appending
/// one mapping per span would duplicate entries.
pub(crate) fn assemble_trace(rows: Vec<RawSpanRow>) -> Result<Option<Trace>, StorageError> {
    if rows.is_empty() {
        return Ok(None);
    }
    let mut spans: Vec<Span> = Vec::with_capacity(rows.len());
    let mut process_map: Vec<ProcessMapping> = Vec::new();
    let mut seen_processes: HashSet<String> = HashSet::new();
    for row in rows {
        if seen_processes.insert(row.process_id.clone()) {
            process_map.push(ProcessMapping {
                process_id: row.process_id.clone(),
                process: Process {
                    service_name: row.service_name.clone(),
                    tags: decode_process_tags(row.id, &row.process_tags)?,
                },
            });
        }
        spans.push(row_to_span(row)?);
    }
    Ok(Some(Trace { spans, process_map }))
}

fn decode_process_tags(
    span_id: i64,
    process_tags: &JsonValue,
) -> Result<BTreeMap<String, String>, StorageError> {
    serde_json::from_value(process_tags.clone()).map_err(|e| {
        StorageError::decode(
            format!("decoding process tags of span {span_id}"),
            e.to_string(),
        )
    })
}

fn row_to_span(row: RawSpanRow) -> Result<Span, StorageError> {
    let start_time = u64::try_from(row.start_time).map_err(|_| {
        StorageError::decode(
            format!("reading span {}", row.id),
            format!("start_time {} is negative", row.start_time),
        )
    })?;
    let duration = u64::try_from(row.duration).map_err(|_| {
        StorageError::decode(
            format!("reading span {}", row.id),
            format!("duration {} is negative", row.duration),
        )
    })?;
    Ok(Span {
        id: row.id,
        trace_id: TraceId::from_db(row.trace_id_high, row.trace_id_low),
        service_name: row.service_name,
        operation_name: row.operation_name,
        process_id: row.process_id,
        start_time,
        duration,
        references: row
            .child_span_ids
            .into_iter()
            .map(|child_span_id| SpanRef { child_span_id })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64, process_id: &str, service_name: &str, start_time: i64) -> RawSpanRow {
        RawSpanRow {
            id,
            trace_id_high: 0,
            trace_id_low: 42,
            operation_name: format!("op-{id}"),
            service_name: service_name.to_string(),
            process_id: process_id.to_string(),
            process_tags: json!({"hostname": format!("host-{id}")}),
            start_time,
            duration: 100,
            child_span_ids: vec![],
        }
    }

    #[test]
    fn no_rows_yield_no_trace() {
        assert_eq!(assemble_trace(vec![]).unwrap(), None);
    }

    #[test]
    fn process_map_has_one_entry_per_distinct_process_id() {
        // 4 spans over 2 processes
        let rows = vec![
            row(1, "p1", "frontend", 10),
            row(2, "p1", "frontend", 20),
            row(3, "p2", "backend", 30),
            row(4, "p2", "backend", 40),
        ];
        let trace = assemble_trace(rows).unwrap().unwrap();
        assert_eq!(trace.spans.len(), 4);
        assert_eq!(trace.process_map.len(), 2);
        assert_eq!(trace.process_map[0].process_id, "p1");
        assert_eq!(trace.process_map[1].process_id, "p2");
    }

    #[test]
    fn first_seen_process_mapping_wins() {
        let mut first = row(1, "p1", "frontend", 10);
        first.process_tags = json!({"hostname": "web-1"});
        let mut second = row(2, "p1", "frontend", 20);
        second.process_tags = json!({"hostname": "web-2"});
        let trace = assemble_trace(vec![first, second]).unwrap().unwrap();
        assert_eq!(trace.process_map.len(), 1);
        assert_eq!(
            trace.process_map[0].process.tags.get("hostname"),
            Some(&"web-1".to_string())
        );
    }

    #[test]
    fn span_row_order_is_preserved() {
        let rows = vec![
            row(1, "p1", "frontend", 10),
            row(2, "p1", "frontend", 20),
            row(3, "p1", "frontend", 30),
        ];
        let trace = assemble_trace(rows).unwrap().unwrap();
        let start_times: Vec<u64> = trace.spans.iter().map(|s| s.start_time).collect();
        assert_eq!(start_times, vec![10, 20, 30]);
    }

    #[test]
    fn outbound_references_are_carried_over() {
        let mut parent = row(1, "p1", "frontend", 10);
        parent.child_span_ids = vec![2, 3];
        let trace = assemble_trace(vec![parent]).unwrap().unwrap();
        assert_eq!(
            trace.spans[0].references,
            vec![SpanRef { child_span_id: 2 }, SpanRef { child_span_id: 3 }]
        );
    }

    #[test]
    fn malformed_process_tags_surface_a_decode_error() {
        let mut bad = row(1, "p1", "frontend", 10);
        bad.process_tags = json!(["not", "a", "map"]);
        assert!(matches!(
            assemble_trace(vec![bad]),
            Err(StorageError::Decode { .. })
        ));
    }

    #[test]
    fn negative_duration_surfaces_a_decode_error() {
        let mut bad = row(1, "p1", "frontend", 10);
        bad.duration = -1;
        assert!(matches!(
            assemble_trace(vec![bad]),
            Err(StorageError::Decode { .. })
        ));
    }
}
