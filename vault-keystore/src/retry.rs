//! Retry policy for transient database errors: a fast phase of five
//! attempts backing off from 1 s to 10 s, then a slow phase of up to ~60
//! attempts at a flat 60 s, before giving up and surfacing the error to
//! the caller as fatal. Only [`crate::error::classify_sqlx_error`]
//! transient kinds are retried; anything else returns immediately.

use std::future::Future;
use std::time::Duration;

const FAST_ATTEMPTS: u32 = 5;
const FAST_BASE: Duration = Duration::from_secs(1);
const FAST_CAP: Duration = Duration::from_secs(10);
const SLOW_ATTEMPTS: u32 = 60;
const SLOW_DELAY: Duration = Duration::from_secs(60);

fn delay_for(attempt: u32) -> Duration {
    if attempt <= FAST_ATTEMPTS {
        let backoff = FAST_BASE.saturating_mul(1u32 << (attempt - 1).min(31));
        backoff.min(FAST_CAP)
    } else {
        SLOW_DELAY
    }
}

/// Run `f` until it succeeds, returns a non-transient error, or exhausts
/// the fast-then-slow retry budget.
pub async fn with_retry<T, F, Fut>(mut f: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if crate::error::classify_sqlx_error(&e) => {
                attempt += 1;
                if attempt > FAST_ATTEMPTS + SLOW_ATTEMPTS {
                    return Err(e);
                }
                tokio::time::sleep(delay_for(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fast_phase_backs_off_from_one_to_ten_seconds() {
        assert_eq!(delay_for(1), Duration::from_secs(1));
        assert_eq!(delay_for(2), Duration::from_secs(2));
        assert_eq!(delay_for(3), Duration::from_secs(4));
        assert_eq!(delay_for(4), Duration::from_secs(8));
        assert_eq!(delay_for(5), Duration::from_secs(10));
    }

    #[test]
    fn slow_phase_is_flat_sixty_seconds() {
        assert_eq!(delay_for(6), Duration::from_secs(60));
        assert_eq!(delay_for(65), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(sqlx::Error::PoolClosed)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_non_transient_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, sqlx::Error> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
