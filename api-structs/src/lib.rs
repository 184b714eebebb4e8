use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

pub mod time_conversion;

pub type ServiceName = String;
pub type OperationName = String;

/// Traces with no explicit result count get at most this many ids back.
pub const DEFAULT_NUM_TRACES: i64 = 10;

/// 128 bit trace identifier, split in two halves the same way the storage
/// schema splits it (`trace_id_high`/`trace_id_low`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct TraceId {
    pub high: u64,
    pub low: u64,
}

impl TraceId {
    /// Bit-preserving cast into the BIGINT pair stored in the spans table.
    pub fn to_db(self) -> (i64, i64) {
        (self.high as i64, self.low as i64)
    }
    pub fn from_db(high: i64, low: i64) -> Self {
        Self {
            high: high as u64,
            low: low as u64,
        }
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpanRef {
    pub child_span_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub id: i64,
    pub trace_id: TraceId,
    pub service_name: ServiceName,
    pub operation_name: OperationName,
    pub process_id: String,
    /// Nanos since unix epoch
    pub start_time: u64,
    /// Nanos
    pub duration: u64,
    pub references: Vec<SpanRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Process {
    pub service_name: ServiceName,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessMapping {
    pub process_id: String,
    pub process: Process,
}

/// All spans sharing one trace id pair, plus one process map entry per
/// distinct process id appearing among them (never one per span).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Trace {
    pub spans: Vec<Span>,
    pub process_map: Vec<ProcessMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DependencyLink {
    pub parent_service_id: i64,
    pub parent: ServiceName,
    pub child_service_id: i64,
    pub child: ServiceName,
    pub call_count: u64,
}

/// Search criteria for trace queries. All present fields are combined with
/// logical AND, absent fields impose no constraint.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TraceQuery {
    pub service_name: Option<ServiceName>,
    pub operation_name: Option<OperationName>,
    /// Nanos since unix epoch
    pub start_time_min: Option<u64>,
    pub start_time_max: Option<u64>,
    /// Nanos
    pub duration_min: Option<u64>,
    pub duration_max: Option<u64>,
    /// Process tag key/value pairs the matching span's process must carry
    pub tags: BTreeMap<String, String>,
    /// Maximum number of distinct trace ids to return, 0 or negative means
    /// the default of [DEFAULT_NUM_TRACES]
    pub num_traces: i64,
}

impl TraceQuery {
    pub fn effective_num_traces(&self) -> i64 {
        if self.num_traces <= 0 {
            DEFAULT_NUM_TRACES
        } else {
            self.num_traces
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_db_casts_are_bit_preserving() {
        let ids = [
            TraceId { high: 0, low: 0 },
            TraceId { high: 1, low: 42 },
            TraceId {
                high: u64::MAX,
                low: u64::MAX - 41,
            },
            TraceId {
                high: 1 << 63,
                low: 7,
            },
        ];
        for id in ids {
            let (high, low) = id.to_db();
            assert_eq!(TraceId::from_db(high, low), id);
        }
    }

    #[test]
    fn trace_id_displays_as_32_hex_chars() {
        let id = TraceId {
            high: 0xdead_beef,
            low: 0x42,
        };
        assert_eq!(id.to_string(), "00000000deadbeef0000000000000042");
    }

    #[test]
    fn num_traces_defaults_to_10_when_non_positive() {
        assert_eq!(TraceQuery::default().effective_num_traces(), 10);
        let negative = TraceQuery {
            num_traces: -3,
            ..TraceQuery::default()
        };
        assert_eq!(negative.effective_num_traces(), 10);
        let explicit = TraceQuery {
            num_traces: 5,
            ..TraceQuery::default()
        };
        assert_eq!(explicit.effective_num_traces(), 5);
    }
}
