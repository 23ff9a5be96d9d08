use {crate::error::RpcError, std::time::Duration};

/// Capped exponential backoff. Rate limit responses wait the full cap right
/// away since providers meter in fixed windows.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (starting at 0), or `None` when
    /// the attempts are exhausted.
    pub fn delay(&self, attempt: u32, rate_limited: bool) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        if rate_limited {
            return Some(self.cap);
        }
        let exp = self.initial.saturating_mul(2u32.saturating_pow(attempt));
        Some(exp.min(self.cap))
    }
}

/// Runs `op` until it succeeds, fails permanently, or exhausts the retry
/// budget. Only retryable [`RpcError`]s are retried.
pub async fn with_backoff<T, F, Fut>(backoff: Backoff, mut op: F) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                let rate_limited = matches!(err, RpcError::RateLimited(_));
                let Some(delay) = backoff.delay(attempt, rate_limited) else {
                    return Err(err);
                };
                tracing::debug!(attempt, ?delay, error = %err, "retrying rpc call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicU32, Ordering},
    };

    #[test]
    fn backoff_doubles_up_to_cap() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(5),
            max_attempts: 10,
        };
        assert_eq!(backoff.delay(0, false), Some(Duration::from_secs(1)));
        assert_eq!(backoff.delay(1, false), Some(Duration::from_secs(2)));
        assert_eq!(backoff.delay(2, false), Some(Duration::from_secs(4)));
        assert_eq!(backoff.delay(3, false), Some(Duration::from_secs(5)));
        assert_eq!(backoff.delay(10, false), None);
        // rate limits jump straight to the cap
        assert_eq!(backoff.delay(0, true), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(Backoff::default(), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(RpcError::Timeout)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let backoff = Backoff {
            max_attempts: 2,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(backoff, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RpcError::Timeout) }
        })
        .await;
        assert!(result.is_err());
        // initial call plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
