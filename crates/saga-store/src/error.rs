use thiserror::Error;

/// SQLSTATE codes that mean "another transaction got there first".
const CONFLICT_SQLSTATES: [&str; 3] = [
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "23505", // unique_violation on a concurrent first insert
];

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// A concurrent transaction on the same saga committed first.
    #[error("Write conflict on saga {saga_name}/{saga_key}")]
    Conflict { saga_name: String, saga_key: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaStoreError {
    /// Returns true if retrying the whole transaction may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaStoreError::Conflict { .. })
    }

    /// Returns true for conflicts and database errors, which a fresh
    /// transaction may get past. Serialization and migration errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SagaStoreError::Conflict { .. } | SagaStoreError::Database(_)
        )
    }

    /// Classifies a database error raised while working on one saga row.
    pub(crate) fn from_database(err: sqlx::Error, saga_name: &str, saga_key: &str) -> Self {
        let conflict = matches!(
            &err,
            sqlx::Error::Database(db_err)
                if db_err
                    .code()
                    .is_some_and(|code| CONFLICT_SQLSTATES.iter().any(|state| *state == code))
        );
        if conflict {
            return SagaStoreError::Conflict {
                saga_name: saga_name.to_string(),
                saga_key: saga_key.to_string(),
            };
        }
        SagaStoreError::Database(err)
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
