//! Paced retry driver.
//!
//! One [`Pacer`] governs every RPC a remote makes. It keeps a current sleep
//! interval bounded by `[min_sleep, max_sleep]`: each call sleeps the
//! interval before invoking the operation, then multiplies the interval by
//! the decay constant on a retryable failure (capped at `max_sleep`) and
//! divides it on success (floored at `min_sleep`). The error type decides
//! what counts as retryable by implementing [`Classify`].

use std::future::Future;

/// How the pacer should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient transport failure: back off and retry.
    Retry,
    /// Credentials expired: re-authenticate, then retry without consuming
    /// an attempt.
    RefreshAuth,
    /// Surface the error to the caller now. Fatal and ordinary errors both
    /// land here; the pacer does not distinguish them.
    NoRetry,
}

/// Implemented by error types passed through [`Pacer::call`].
pub trait Classify {
    fn retry_class(&self) -> RetryClass;
}

/// Backoff start when a retry hits a pacer whose interval has decayed to
/// zero (`min_sleep` of zero means "don't pace successful calls", not
/// "retry in a tight loop").
const FIRST_RETRY_SLEEP: std::time::Duration = std::time::Duration::from_millis(10);

#[derive(Debug)]
pub struct Pacer {
    min_sleep: std::time::Duration,
    max_sleep: std::time::Duration,
    decay: u32,
    retries: u32,
    sleep_time: tokio::sync::Mutex<std::time::Duration>,
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new()
    }
}

impl Pacer {
    pub fn new() -> Self {
        let min_sleep = std::time::Duration::from_millis(10);
        Self {
            min_sleep,
            max_sleep: std::time::Duration::from_secs(2),
            decay: 2,
            retries: 10,
            sleep_time: tokio::sync::Mutex::new(min_sleep),
        }
    }

    pub fn min_sleep(mut self, min_sleep: std::time::Duration) -> Self {
        self.min_sleep = min_sleep;
        self.sleep_time = tokio::sync::Mutex::new(min_sleep);
        self
    }

    pub fn max_sleep(mut self, max_sleep: std::time::Duration) -> Self {
        self.max_sleep = max_sleep;
        self
    }

    /// The multiplier/divisor applied to the sleep interval. Must be >= 1.
    pub fn decay(mut self, decay: u32) -> Self {
        self.decay = decay.max(1);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    async fn begin(&self) {
        let sleep_time = *self.sleep_time.lock().await;
        if sleep_time > std::time::Duration::ZERO {
            tokio::time::sleep(sleep_time).await;
        }
    }

    async fn end(&self, retried: bool) {
        let mut sleep_time = self.sleep_time.lock().await;
        *sleep_time = if retried {
            if sleep_time.is_zero() {
                // a zero interval can't grow geometrically; seed it so a
                // pacer with a zero floor still backs off under retries
                FIRST_RETRY_SLEEP.min(self.max_sleep)
            } else {
                (*sleep_time * self.decay).min(self.max_sleep)
            }
        } else {
            (*sleep_time / self.decay).max(self.min_sleep)
        };
    }

    /// Run `f` under the pacer, retrying retryable failures up to the
    /// configured number of attempts. A `RefreshAuth` classification retries
    /// once without consuming an attempt (re-authentication is the backend's
    /// job inside `f` when no hook is supplied).
    pub async fn call<T, E, F, Fut>(&self, mut f: F) -> Result<T, E>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(self.retries, &mut f, None::<&mut NoReauth<E>>).await
    }

    /// Like [`Pacer::call`] but invokes `reauth` when the error class is
    /// `RefreshAuth`. The hook runs at most once per call, and the attempt
    /// that triggered it is not counted.
    pub async fn call_with_reauth<T, E, F, Fut, R, RFut>(
        &self,
        mut f: F,
        mut reauth: R,
    ) -> Result<T, E>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = Result<(), E>>,
    {
        self.run(self.retries, &mut f, Some(&mut reauth)).await
    }

    /// A single paced attempt. For uploads where the caller must rebuild
    /// state (e.g. re-acquire an upload URL) between attempts, so the retry
    /// loop lives in the caller.
    pub async fn call_no_retry<T, E, F, Fut>(&self, mut f: F) -> Result<T, E>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(1, &mut f, None::<&mut NoReauth<E>>).await
    }

    async fn run<T, E, F, Fut, R, RFut>(
        &self,
        attempts: u32,
        f: &mut F,
        mut reauth: Option<&mut R>,
    ) -> Result<T, E>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = Result<(), E>>,
    {
        let mut attempts_left = attempts;
        let mut reauthed = false;
        loop {
            self.begin().await;
            let err = match f().await {
                Ok(value) => {
                    self.end(false).await;
                    return Ok(value);
                }
                Err(err) => err,
            };
            match err.retry_class() {
                RetryClass::Retry => {
                    self.end(true).await;
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(err);
                    }
                    tracing::debug!(
                        "low level retry {}/{}: {}",
                        attempts - attempts_left,
                        attempts,
                        err
                    );
                }
                RetryClass::RefreshAuth => {
                    self.end(false).await;
                    if reauthed {
                        return Err(err);
                    }
                    reauthed = true;
                    tracing::debug!("re-authenticating after: {}", err);
                    if let Some(reauth) = reauth.as_mut() {
                        reauth().await?;
                    }
                    // the failed attempt is not counted
                }
                RetryClass::NoRetry => {
                    self.end(false).await;
                    return Err(err);
                }
            }
        }
    }
}

// placeholder hook type for calls without a re-authentication hook
type NoReauth<E> = fn() -> std::future::Ready<Result<(), E>>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[derive(Debug)]
    enum TestError {
        Transient,
        AuthExpired,
        Hard,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Classify for TestError {
        fn retry_class(&self) -> RetryClass {
            match self {
                TestError::Transient => RetryClass::Retry,
                TestError::AuthExpired => RetryClass::RefreshAuth,
                TestError::Hard => RetryClass::NoRetry,
            }
        }
    }

    fn fast_pacer() -> Pacer {
        Pacer::new()
            .min_sleep(std::time::Duration::ZERO)
            .max_sleep(std::time::Duration::from_millis(1))
    }

    #[test(tokio::test)]
    async fn retries_transient_errors_until_success() {
        let pacer = fast_pacer().retries(5);
        let calls = std::sync::atomic::AtomicU32::new(0);
        let calls = &calls;
        let result: Result<u32, TestError> = pacer
            .call(|| async move {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 3 {
                    Err(TestError::Transient)
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[test(tokio::test)]
    async fn gives_up_after_max_retries() {
        let pacer = fast_pacer().retries(3);
        let calls = std::sync::atomic::AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), TestError> = pacer
            .call(|| async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(TestError::Transient)
            })
            .await;
        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test(tokio::test)]
    async fn hard_errors_are_not_retried() {
        let pacer = fast_pacer().retries(5);
        let calls = std::sync::atomic::AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), TestError> = pacer
            .call(|| async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(TestError::Hard)
            })
            .await;
        assert!(matches!(result, Err(TestError::Hard)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn reauthenticates_once_without_consuming_attempts() {
        let pacer = fast_pacer().retries(3);
        let calls = std::sync::atomic::AtomicU32::new(0);
        let reauths = std::sync::atomic::AtomicU32::new(0);
        let (calls, reauths) = (&calls, &reauths);
        let result: Result<&str, TestError> = pacer
            .call_with_reauth(
                || async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if reauths.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                        Err(TestError::AuthExpired)
                    } else {
                        Ok("ok")
                    }
                },
                || async move {
                    reauths.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(reauths.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test(tokio::test)]
    async fn second_auth_failure_surfaces() {
        let pacer = fast_pacer().retries(3);
        let result: Result<(), TestError> = pacer
            .call_with_reauth(
                || async { Err(TestError::AuthExpired) },
                || async { Ok(()) },
            )
            .await;
        assert!(matches!(result, Err(TestError::AuthExpired)));
    }

    #[test(tokio::test)]
    async fn call_no_retry_makes_one_attempt() {
        let pacer = fast_pacer();
        let calls = std::sync::atomic::AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), TestError> = pacer
            .call_no_retry(|| async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(TestError::Transient)
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn zero_floor_still_backs_off() {
        let pacer = Pacer::new()
            .min_sleep(std::time::Duration::ZERO)
            .max_sleep(std::time::Duration::from_millis(100));
        assert_eq!(*pacer.sleep_time.lock().await, std::time::Duration::ZERO);
        // the first retry seeds the interval, further ones grow it
        pacer.end(true).await;
        assert_eq!(
            *pacer.sleep_time.lock().await,
            std::time::Duration::from_millis(10)
        );
        pacer.end(true).await;
        assert_eq!(
            *pacer.sleep_time.lock().await,
            std::time::Duration::from_millis(20)
        );
        // successes decay back towards the zero floor
        pacer.end(false).await;
        assert_eq!(
            *pacer.sleep_time.lock().await,
            std::time::Duration::from_millis(10)
        );
    }

    #[test(tokio::test)]
    async fn interval_decays_and_recovers() {
        let pacer = Pacer::new()
            .min_sleep(std::time::Duration::from_nanos(1))
            .max_sleep(std::time::Duration::from_nanos(8))
            .retries(10);
        // three failures: 1 -> 2 -> 4 -> 8 (capped)
        for _ in 0..4 {
            pacer.end(true).await;
        }
        assert_eq!(
            *pacer.sleep_time.lock().await,
            std::time::Duration::from_nanos(8)
        );
        // successes halve back down to the floor
        for _ in 0..5 {
            pacer.end(false).await;
        }
        assert_eq!(
            *pacer.sleep_time.lock().await,
            std::time::Duration::from_nanos(1)
        );
    }
}
