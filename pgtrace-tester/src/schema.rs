use sqlx::PgPool;

/// Drops and recreates the span store tables. The read path never touches
/// the schema, this harness stands in for the write path.
pub async fn recreate_schema(con: &PgPool) {
    let statements = [
        "drop table if exists span_refs",
        "drop table if exists spans",
        "drop table if exists operations",
        "drop table if exists services",
        "create table services
         (
             id           bigserial primary key,
             service_name text not null unique
         )",
        "create table operations
         (
             id             bigserial primary key,
             operation_name text not null unique
         )",
        "create table spans
         (
             id            bigserial primary key,
             trace_id_low  bigint not null,
             trace_id_high bigint not null,
             operation_id  bigint not null references operations (id),
             service_id    bigint not null references services (id),
             process_id    text   not null,
             process_tags  jsonb  not null default '{}',
             start_time    bigint not null,
             duration      bigint not null
         )",
        "create table span_refs
         (
             id            bigint not null references spans (id),
             child_span_id bigint not null references spans (id)
         )",
    ];
    for statement in statements {
        sqlx::query(statement)
            .execute(con)
            .await
            .unwrap_or_else(|e| panic!("schema statement should run: {statement}: {e}"));
    }
}

pub async fn insert_service(con: &PgPool, service_name: &str) -> i64 {
    sqlx::query_scalar::<sqlx::Postgres, i64>(
        "insert into services (service_name) values ($1) returning id",
    )
    .bind(service_name)
    .fetch_one(con)
    .await
    .expect("service insert to work")
}

pub async fn insert_operation(con: &PgPool, operation_name: &str) -> i64 {
    sqlx::query_scalar::<sqlx::Postgres, i64>(
        "insert into operations (operation_name) values ($1) returning id",
    )
    .bind(operation_name)
    .fetch_one(con)
    .await
    .expect("operation insert to work")
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_span(
    con: &PgPool,
    trace_id: api_structs::TraceId,
    operation_id: i64,
    service_id: i64,
    process_id: &str,
    process_tags: serde_json::Value,
    start_time_nanos: u64,
    duration_nanos: u64,
) -> i64 {
    let (trace_id_high, trace_id_low) = trace_id.to_db();
    sqlx::query_scalar::<sqlx::Postgres, i64>(
        "insert into spans (trace_id_low, trace_id_high, operation_id, service_id, process_id,
                            process_tags, start_time, duration)
         values ($1, $2, $3, $4, $5, $6, $7, $8)
         returning id",
    )
    .bind(trace_id_low)
    .bind(trace_id_high)
    .bind(operation_id)
    .bind(service_id)
    .bind(process_id)
    .bind(process_tags)
    .bind(i64::try_from(start_time_nanos).expect("start time to fit i64"))
    .bind(i64::try_from(duration_nanos).expect("duration to fit i64"))
    .fetch_one(con)
    .await
    .expect("span insert to work")
}

pub async fn insert_span_ref(con: &PgPool, parent_span_id: i64, child_span_id: i64) {
    sqlx::query("insert into span_refs (id, child_span_id) values ($1, $2)")
        .bind(parent_span_id)
        .bind(child_span_id)
        .execute(con)
        .await
        .expect("span ref insert to work");
}
