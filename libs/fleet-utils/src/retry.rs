//! Bounded-backoff retry for storage writes (spec §7: database failures
//! inside the task worker are retried with a bounded backoff — at most 3
//! tries, at most 5s total — before the caller declares failure; the
//! limiter's stop-task inserts use the same policy).

use std::future::Future;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
/// Sleep between attempt 1→2 and 2→3 respectively; 3s total, under the 5s
/// budget spec §7 allows.
const BACKOFF_STEPS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

/// Calls `op` until it succeeds or [`MAX_ATTEMPTS`] have been made,
/// sleeping the matching `BACKOFF_STEPS` entry in between. Returns the
/// last error once attempts are exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(e);
                }
                tokio::time::sleep(BACKOFF_STEPS[(attempt - 1) as usize]).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures_without_exceeding_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u8, &'static str> = retry_with_backoff(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("not yet")
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u8, &'static str> = retry_with_backoff(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("still broken")
        })
        .await;
        assert_eq!(result, Err("still broken"));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
