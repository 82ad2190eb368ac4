use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("maintenance pass already in progress")]
    MaintenanceInProgress,
}

impl CacheError {
    /// True for SQLITE_BUSY / SQLITE_LOCKED, the only errors worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_detection_only_matches_lock_codes() {
        let busy = CacheError::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_busy());

        let other = CacheError::InvalidInvocation("nope".into());
        assert!(!other.is_busy());

        let constraint = CacheError::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!constraint.is_busy());
    }
}
