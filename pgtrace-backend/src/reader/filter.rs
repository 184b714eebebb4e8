use crate::error::StorageError;
use crate::reader::nanos_to_db_i64;
use api_structs::TraceQuery;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BindValue {
    Text(String),
    BigInt(i64),
}

/// Conjunctive predicate over the joined span/operation/service rows.
///
/// Fragments are accumulated in criteria evaluation order and rendered with
/// positional placeholders, values only ever travel as bound parameters.
#[derive(Debug, Default)]
pub(crate) struct SpanFilter {
    fragments: Vec<String>,
    params: Vec<BindValue>,
}

impl SpanFilter {
    pub(crate) fn from_query(query: &TraceQuery) -> Result<Self, StorageError> {
        let mut filter = SpanFilter::default();
        if let Some(service_name) = &query.service_name {
            if !service_name.is_empty() {
                filter.and_where(
                    "service.service_name",
                    "=",
                    BindValue::Text(service_name.clone()),
                );
            }
        }
        if let Some(operation_name) = &query.operation_name {
            if !operation_name.is_empty() {
                filter.and_where(
                    "operation.operation_name",
                    "=",
                    BindValue::Text(operation_name.clone()),
                );
            }
        }
        if let Some(start_time_min) = query.start_time_min {
            filter.and_where(
                "span.start_time",
                ">=",
                BindValue::BigInt(nanos_to_db_i64(start_time_min, "start time lower bound")?),
            );
        }
        if let Some(start_time_max) = query.start_time_max {
            filter.and_where(
                "span.start_time",
                "<=",
                BindValue::BigInt(nanos_to_db_i64(start_time_max, "start time upper bound")?),
            );
        }
        if let Some(duration_min) = query.duration_min {
            filter.and_where(
                "span.duration",
                ">=",
                BindValue::BigInt(nanos_to_db_i64(duration_min, "duration lower bound")?),
            );
        }
        if let Some(duration_max) = query.duration_max {
            filter.and_where(
                "span.duration",
                "<=",
                BindValue::BigInt(nanos_to_db_i64(duration_max, "duration upper bound")?),
            );
        }
        for (key, value) in &query.tags {
            filter.and_tag(key, value);
        }
        Ok(filter)
    }

    fn and_where(&mut self, column: &str, operator: &str, value: BindValue) {
        self.params.push(value);
        self.fragments
            .push(format!("{column} {operator} ${}", self.params.len()));
    }

    fn and_tag(&mut self, key: &str, value: &str) {
        self.params.push(BindValue::Text(key.to_string()));
        let key_placeholder = self.params.len();
        self.params.push(BindValue::Text(value.to_string()));
        self.fragments.push(format!(
            "span.process_tags ->> ${key_placeholder} = ${}",
            self.params.len()
        ));
    }

    /// "where a = $1 and b >= $2 ..." or the empty string when no criteria
    /// were present. An empty predicate matches all rows, the caller owns
    /// the result limit.
    pub(crate) fn render(&self) -> String {
        if self.fragments.is_empty() {
            String::new()
        } else {
            format!("where {}", self.fragments.join("\n  and "))
        }
    }

    pub(crate) fn params(&self) -> &[BindValue] {
        &self.params
    }

    pub(crate) fn param_count(&self) -> usize {
        self.params.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn empty_criteria_render_an_unconstrained_predicate() {
        let filter = SpanFilter::from_query(&TraceQuery::default()).unwrap();
        assert_eq!(filter.render(), "");
        assert!(filter.params().is_empty());
    }

    #[test]
    fn all_criteria_render_in_evaluation_order() {
        let mut tags = BTreeMap::new();
        tags.insert("az".to_string(), "eu-1".to_string());
        tags.insert("region".to_string(), "eu".to_string());
        let query = TraceQuery {
            service_name: Some("frontend".to_string()),
            operation_name: Some("GET /".to_string()),
            start_time_min: Some(1_000),
            start_time_max: Some(2_000),
            duration_min: Some(10),
            duration_max: Some(20),
            tags,
            num_traces: 0,
        };
        let filter = SpanFilter::from_query(&query).unwrap();
        insta::assert_snapshot!(filter.render(), @r###"
        where service.service_name = $1
          and operation.operation_name = $2
          and span.start_time >= $3
          and span.start_time <= $4
          and span.duration >= $5
          and span.duration <= $6
          and span.process_tags ->> $7 = $8
          and span.process_tags ->> $9 = $10
        "###);
        assert_eq!(
            filter.params(),
            &[
                BindValue::Text("frontend".to_string()),
                BindValue::Text("GET /".to_string()),
                BindValue::BigInt(1_000),
                BindValue::BigInt(2_000),
                BindValue::BigInt(10),
                BindValue::BigInt(20),
                BindValue::Text("az".to_string()),
                BindValue::Text("eu-1".to_string()),
                BindValue::Text("region".to_string()),
                BindValue::Text("eu".to_string()),
            ]
        );
    }

    #[test]
    fn duration_bounds_select_the_inclusive_range() {
        let query = TraceQuery {
            duration_min: Some(5),
            duration_max: Some(50),
            ..TraceQuery::default()
        };
        let filter = SpanFilter::from_query(&query).unwrap();
        assert_eq!(
            filter.render(),
            "where span.duration >= $1\n  and span.duration <= $2"
        );
    }

    #[test]
    fn absent_criteria_emit_no_fragment() {
        let query = TraceQuery {
            operation_name: Some("query".to_string()),
            ..TraceQuery::default()
        };
        let filter = SpanFilter::from_query(&query).unwrap();
        assert_eq!(filter.render(), "where operation.operation_name = $1");
        assert_eq!(filter.params().len(), 1);
    }

    #[test]
    fn empty_names_are_treated_as_absent() {
        let query = TraceQuery {
            service_name: Some(String::new()),
            operation_name: Some(String::new()),
            ..TraceQuery::default()
        };
        let filter = SpanFilter::from_query(&query).unwrap();
        assert_eq!(filter.render(), "");
    }

    #[test]
    fn out_of_range_start_time_surfaces_an_error() {
        let query = TraceQuery {
            start_time_min: Some(u64::MAX),
            ..TraceQuery::default()
        };
        assert!(SpanFilter::from_query(&query).is_err());
    }
}
