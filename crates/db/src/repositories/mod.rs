use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use thiserror::Error;

use signoff_core::store::StoreError;

pub mod approval;
pub mod timer;
pub mod workflow;

pub use approval::SqlApprovalStore;
pub use timer::SqlTimerStore;
pub use workflow::SqlWorkflowStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("version conflict on {entity} `{id}`")]
    Conflict { entity: &'static str, id: String },
}

impl RepositoryError {
    /// Unique-key violations mean another writer got there first.
    pub(crate) fn from_write(error: sqlx::Error, entity: &'static str, id: &str) -> Self {
        match &error {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict { entity, id: id.to_string() }
            }
            _ => Self::Database(error),
        }
    }
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => Self::Backend(error.to_string()),
            RepositoryError::Decode(message) => Self::Decode(message),
            RepositoryError::Conflict { entity, id } => Self::Conflict { entity, id },
        }
    }
}

/// Fixed-width UTC so stored timestamps compare correctly as text.
pub(crate) fn encode_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn encode_opt_ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(encode_ts)
}

pub(crate) fn decode_ts(raw: &str, column: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}

pub(crate) fn decode_opt_ts(
    raw: Option<String>,
    column: &str,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.as_deref().map(|raw| decode_ts(raw, column)).transpose()
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|error| RepositoryError::Decode(error.to_string()))
}

pub(crate) fn decode_json<T: DeserializeOwned>(raw: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw).map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}

pub(crate) fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(|error| RepositoryError::Decode(error.to_string()))
}

pub(crate) fn get_u32(row: &SqliteRow, column: &str) -> Result<u32, RepositoryError> {
    let raw: i64 = get(row, column)?;
    u32::try_from(raw).map_err(|_| RepositoryError::Decode(format!("{column} out of range: {raw}")))
}

pub(crate) fn parse_enum<T>(
    raw: &str,
    column: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, RepositoryError> {
    parse(raw).ok_or_else(|| RepositoryError::Decode(format!("unknown {column} `{raw}`")))
}
