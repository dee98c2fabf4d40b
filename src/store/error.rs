use thiserror::Error;

/// ストア操作のエラー。呼び出し側は `Transient` のみ再試行する。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// 再試行で回復し得る SQLSTATE。
///
/// 40001 serialization_failure, 40P01 deadlock_detected,
/// 53300 too_many_connections, 57P01 admin_shutdown, 08xxx connection exception.
fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "53300" | "57P01") || code.starts_with("08")
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        let transient = match &error {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
            _ => false,
        };
        if transient {
            StoreError::Transient(error.to_string())
        } else {
            StoreError::Permanent(error.to_string())
        }
    }
}
