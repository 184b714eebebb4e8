use std::backtrace::Backtrace;

/// Read-side storage failure. The context always names the operation and the
/// identifiers or criteria it was working on, so callers can log or retry
/// meaningfully.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{context}\n{backtrace}")]
    Database {
        #[source]
        source: sqlx::Error,
        context: String,
        backtrace: CapturedBacktrace,
    },
    #[error("{context}: {detail}")]
    Decode { context: String, detail: String },
    #[error("{context}: {value} does not fit a database bigint")]
    OutOfRange { value: u64, context: String },
}

impl StorageError {
    pub fn from_sqlx_error<S: Into<String>>(source: sqlx::Error, context: S) -> Self {
        Self::Database {
            source,
            context: context.into(),
            backtrace: CapturedBacktrace::capture(),
        }
    }

    pub(crate) fn decode<S: Into<String>, D: Into<String>>(context: S, detail: D) -> Self {
        Self::Decode {
            context: context.into(),
            detail: detail.into(),
        }
    }
}

/// A batched fetch that failed partway through. Whatever was materialized
/// before the failure is kept, the caller decides whether to use it.
#[derive(Debug, thiserror::Error)]
#[error("fetch failed after materializing {} partial results", .partial.len())]
pub struct PartialFetchError<T: std::fmt::Debug> {
    pub partial: Vec<T>,
    #[source]
    pub source: StorageError,
}

#[derive(Debug)]
pub struct CapturedBacktrace(pub Backtrace);

impl CapturedBacktrace {
    pub fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl std::fmt::Display for CapturedBacktrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn error_chain_to_pretty_formatted<E>(error: &E) -> String
where
    E: std::error::Error,
{
    let mut error: &dyn std::error::Error = error;
    let mut formatted = format!("{}", error);
    while let Some(inner) = error.source() {
        formatted.push_str(&format!("\nCaused by: \n{}", inner));
        error = inner;
    }
    formatted
}
