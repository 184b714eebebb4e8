use crate::error::StorageError;
use api_structs::DependencyLink;
use sqlx::{PgPool, Postgres};
use std::collections::HashMap;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RawReferenceEdge {
    pub parent_service_id: i64,
    pub parent_service_name: String,
    pub child_service_id: i64,
    pub child_service_name: String,
}

/// One row per reference edge whose referencing span started inside the
/// window. The two sides of the edge resolve their service independently:
/// parent through the referencing span, child through the referenced span.
pub(crate) async fn fetch_reference_edges(
    con: &PgPool,
    window_start: i64,
    window_end: i64,
) -> Result<Vec<RawReferenceEdge>, StorageError> {
    sqlx::query_as::<Postgres, RawReferenceEdge>(
        "select parent_span.service_id     as parent_service_id,
       parent_service.service_name as parent_service_name,
       child_span.service_id       as child_service_id,
       child_service.service_name  as child_service_name
from span_refs as span_ref
         join spans as parent_span on parent_span.id = span_ref.id
         join services as parent_service on parent_service.id = parent_span.service_id
         join spans as child_span on child_span.id = span_ref.child_span_id
         join services as child_service on child_service.id = child_span.service_id
where parent_span.start_time >= $1
  and parent_span.start_time <= $2",
    )
    .bind(window_start)
    .bind(window_end)
    .fetch_all(con)
    .await
    .map_err(|e| {
        StorageError::from_sqlx_error(
            e,
            format!("fetching reference edges in window [{window_start}, {window_end}]"),
        )
    })
}

/// Groups edges by (parent service, child service) and counts them, keeping
/// first-seen pair order so the output is deterministic.
pub(crate) fn count_dependency_links(edges: Vec<RawReferenceEdge>) -> Vec<DependencyLink> {
    let mut pair_order: Vec<(i64, i64)> = Vec::new();
    let mut links: HashMap<(i64, i64), DependencyLink> = HashMap::new();
    for edge in edges {
        let pair = (edge.parent_service_id, edge.child_service_id);
        match links.get_mut(&pair) {
            Some(link) => link.call_count += 1,
            None => {
                pair_order.push(pair);
                links.insert(
                    pair,
                    DependencyLink {
                        parent_service_id: edge.parent_service_id,
                        parent: edge.parent_service_name,
                        child_service_id: edge.child_service_id,
                        child: edge.child_service_name,
                        call_count: 1,
                    },
                );
            }
        }
    }
    pair_order
        .into_iter()
        .filter_map(|pair| links.remove(&pair))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(parent_id: i64, parent: &str, child_id: i64, child: &str) -> RawReferenceEdge {
        RawReferenceEdge {
            parent_service_id: parent_id,
            parent_service_name: parent.to_string(),
            child_service_id: child_id,
            child_service_name: child.to_string(),
        }
    }

    #[test]
    fn no_edges_yield_no_links() {
        assert!(count_dependency_links(vec![]).is_empty());
    }

    #[test]
    fn a_single_edge_yields_one_link_with_count_1() {
        let links = count_dependency_links(vec![edge(1, "a", 2, "b")]);
        assert_eq!(
            links,
            vec![DependencyLink {
                parent_service_id: 1,
                parent: "a".to_string(),
                child_service_id: 2,
                child: "b".to_string(),
                call_count: 1,
            }]
        );
    }

    #[test]
    fn repeated_edges_between_the_same_pair_raise_the_count() {
        let links = count_dependency_links(vec![edge(1, "a", 2, "b"), edge(1, "a", 2, "b")]);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].call_count, 2);
    }

    #[test]
    fn parent_and_child_sides_are_kept_apart() {
        // a calling b is not the same pair as b calling a
        let links = count_dependency_links(vec![edge(1, "a", 2, "b"), edge(2, "b", 1, "a")]);
        assert_eq!(links.len(), 2);
        assert_eq!((links[0].parent.as_str(), links[0].child.as_str()), ("a", "b"));
        assert_eq!((links[1].parent.as_str(), links[1].child.as_str()), ("b", "a"));
    }

    #[test]
    fn pairs_come_out_in_first_seen_order() {
        let links = count_dependency_links(vec![
            edge(3, "c", 1, "a"),
            edge(1, "a", 2, "b"),
            edge(3, "c", 1, "a"),
        ]);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].parent, "c");
        assert_eq!(links[0].call_count, 2);
        assert_eq!(links[1].parent, "a");
    }
}
