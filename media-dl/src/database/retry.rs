//! Busy-retry wrapper for SQLite writes.
//!
//! WAL mode still allows only one writer. A write that loses the race for the
//! lock after the busy timeout surfaces as `SQLITE_BUSY`/`SQLITE_LOCKED`; those
//! are retried with capped, jittered exponential backoff.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 10;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 1000;

const BUSY_MESSAGES: [&str; 2] = ["database is locked", "database is busy"];

fn mentions_busy(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    BUSY_MESSAGES.iter().any(|needle| msg.contains(needle))
}

/// Whether `err` is a transient lock conflict.
pub(crate) fn is_sqlite_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    match sqlx_err {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            let code = db_err.code().map(Cow::into_owned);
            matches!(code.as_deref(), Some("5") | Some("6")) || mentions_busy(db_err.message())
        }
        other => mentions_busy(&other.to_string()),
    }
}

fn busy_delay(attempt: u32) -> Duration {
    let base = BUSY_BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(BUSY_MAX_DELAY_MS);
    let jitter = random::<u64>() % (base / 4 + 1);
    Duration::from_millis((base + jitter).min(BUSY_MAX_DELAY_MS))
}

/// Run `op` until it succeeds, fails with a non-busy error, or the retry
/// budget is spent.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_sqlite_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let delay = busy_delay(attempt);
                attempt += 1;
                debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_busy_delay_is_capped() {
        for attempt in 0..40 {
            assert!(busy_delay(attempt) <= Duration::from_millis(BUSY_MAX_DELAY_MS));
        }
    }

    #[tokio::test]
    async fn test_non_busy_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_sqlite_busy("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Other("boom".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_error_is_retried() {
        let calls = AtomicU32::new(0);
        let result = retry_on_sqlite_busy("test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::DatabaseSqlx(sqlx::Error::Protocol(
                    "database is locked".into(),
                )))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
