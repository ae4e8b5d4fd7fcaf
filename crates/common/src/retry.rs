use std::time::Duration;

/// Retry `f` with exponential backoff plus a small random jitter.
///
/// # Arguments
/// * `f` - The operation to retry
/// * `max_attempts` - Total number of attempts, at least one is always made
/// * `base_delay` - Delay before the second attempt (doubles each retry)
/// * `operation_name` - Human-readable name for logging
pub fn retry_with_backoff<F, T, E>(
    mut f: F,
    max_attempts: u32,
    base_delay: Duration,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(e) if attempt + 1 < max_attempts => {
                let delay = backoff_delay(base_delay, attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    operation = operation_name,
                    attempts = max_attempts,
                    error = %e,
                    "Operation failed, giving up"
                );
                return Err(e);
            }
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(10)));
    let jitter_ms = (exp.as_millis() as u64 / 10).max(1);
    exp.saturating_add(Duration::from_millis(fastrand::u64(0..jitter_ms)))
}
