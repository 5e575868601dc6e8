use chrono::{DateTime, SecondsFormat, Utc};
use types::MemoryError;

pub(crate) fn connection_error(message: String) -> MemoryError {
    MemoryError::Connection { message }
}

pub(crate) fn initialization_error(message: String) -> MemoryError {
    MemoryError::Initialization { message }
}

pub(crate) fn migration_error(message: String) -> MemoryError {
    MemoryError::Migration { message }
}

pub(crate) fn query_error(message: String) -> MemoryError {
    MemoryError::Query { message }
}

/// Fixed-width UTC form so stored timestamps sort lexicographically.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_timestamp(value: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| query_error(format!("invalid stored timestamp `{value}`: {error}")))
}

pub(crate) fn to_sql_integer(value: u64, what: &str) -> Result<i64, MemoryError> {
    i64::try_from(value).map_err(|_| query_error(format!("{what} exceeds sqlite integer range")))
}

pub(crate) fn from_sql_integer(value: i64, what: &str) -> Result<u64, MemoryError> {
    u64::try_from(value).map_err(|_| query_error(format!("stored {what} is negative")))
}
