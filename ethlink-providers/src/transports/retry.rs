//! A [`JsonRpcClient`] implementation that retries requests filtered by a
//! [`RetryPolicy`], with capped exponential backoff plus jitter, keeping the
//! full failure history for diagnostics.

use crate::{errors::classify_client_error, JsonRpcClient, JsonRpcError, ProviderError, RpcError};

use std::{
    fmt::Debug,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// [`RetryPolicy`] defines logic for which [`JsonRpcClient::Error`] instances
/// the client should retry the request and try to recover from.
pub trait RetryPolicy<E>: Send + Sync + Debug {
    /// Whether the given failure is worth a further attempt.
    fn should_retry(&self, error: &E) -> bool;
}

/// RPC error messages that indicate a transient node-side condition.
///
/// Matched case-insensitively against the error response message.
const RETRYABLE_MESSAGES: &[&str] = &[
    "header not found",
    "timeout",
    "connection reset",
    "temporary unavailable",
    "try again",
    "underpriced",
    "nonce too low",
    "rate limit",
    "too many requests",
    "429",
    "internal error",
    "-32603",
    "server busy",
    "overloaded",
];

/// The default [`RetryPolicy`]: retries transport-level failures and the
/// transient classes of RPC error responses.
///
/// Never retries reverts (an error response whose `data` carries revert
/// bytes is a contract-level outcome) or "insufficient funds" failures,
/// which no amount of waiting will fix.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcRetryPolicy;

impl<E: RpcError> RetryPolicy<E> for JsonRpcRetryPolicy {
    fn should_retry(&self, error: &E) -> bool {
        if let Some(rpc) = error.as_error_response() {
            if rpc.revert_data().is_some() {
                return false
            }
            let message = rpc.message.to_lowercase();
            if message.contains("insufficient funds") {
                return false
            }
            return rpc.code == -32603 ||
                RETRYABLE_MESSAGES.iter().any(|candidate| message.contains(candidate))
        }
        error.is_transport_error()
    }
}

/// A [`RetryPolicy`] that only retries failures thrown by the transport
/// itself; error responses produced by the node surface to the caller
/// untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportOnlyRetryPolicy;

impl<E: RpcError> RetryPolicy<E> for TransportOnlyRetryPolicy {
    fn should_retry(&self, error: &E) -> bool {
        error.is_transport_error()
    }
}

/// Capped exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Nominal delay before the first retry.
    pub base: Duration,
    /// Upper bound on the nominal delay.
    pub cap: Duration,
    /// Jitter factor range; the capped delay is scaled by
    /// `1 + uniform(jitter.0, jitter.1)`.
    pub jitter: (f64, f64),
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(200), cap: Duration::from_secs(5), jitter: (0.10, 0.25) }
    }
}

impl Backoff {
    /// The delay to sleep before retry number `retry` (1-based: the first
    /// retry after the first failed attempt is `retry = 1`).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let nominal = self.base.saturating_mul(1u32 << exponent).min(self.cap);
        let (jmin, jmax) = self.jitter;
        let factor = if jmax > jmin {
            1.0 + rand::thread_rng().gen_range(jmin..=jmax)
        } else {
            1.0 + jmin
        };
        nominal.mul_f64(factor)
    }
}

/// One failed attempt inside a retry loop.
#[derive(Debug)]
pub struct Attempt<E> {
    /// Time since the first attempt started when this failure was observed.
    pub after: Duration,
    /// The failure itself.
    pub error: E,
}

/// [`RetryClient`] presents as a wrapper around [`JsonRpcClient`] that will
/// retry requests based on the backoff strategy, filtering through its
/// [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryClient<T>
where
    T: JsonRpcClient,
{
    inner: T,
    policy: Box<dyn RetryPolicy<T::Error>>,
    max_attempts: u32,
    backoff: Backoff,
}

impl<T> RetryClient<T>
where
    T: JsonRpcClient,
{
    /// Wraps `inner` with the default policy, five attempts and default
    /// backoff.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use ethlink_providers::{Http, RetryClient};
    /// # use std::str::FromStr;
    /// let http = Http::from_str("http://localhost:8545").unwrap();
    /// let client = RetryClient::new(http);
    /// ```
    pub fn new(inner: T) -> Self {
        RetryClientBuilder::default().build(inner, Box::new(JsonRpcRetryPolicy))
    }

    /// Access to the wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

/// Builder for a [`RetryClient`].
#[derive(Debug, Clone, Copy)]
pub struct RetryClientBuilder {
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for RetryClientBuilder {
    fn default() -> Self {
        Self { max_attempts: 5, backoff: Backoff::default() }
    }
}

impl RetryClientBuilder {
    /// Total number of attempts, including the first one. Clamped to at
    /// least 1.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// The backoff schedule applied between attempts.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Builds the client with the given transport and policy.
    pub fn build<T>(self, inner: T, policy: Box<dyn RetryPolicy<T::Error>>) -> RetryClient<T>
    where
        T: JsonRpcClient,
    {
        RetryClient { inner, policy, max_attempts: self.max_attempts, backoff: self.backoff }
    }
}

/// Error thrown by a [`RetryClient`].
#[derive(Error, Debug)]
pub enum RetryClientError<T>
where
    T: JsonRpcClient,
{
    /// A non-retryable failure, surfaced verbatim after a single attempt.
    #[error(transparent)]
    Inner(T::Error),

    /// All attempts failed with retryable errors; carries the ordered
    /// failure history (the last entry is the terminal failure).
    #[error("exhausted {attempts} attempts over {elapsed:?}; last error: {}", .history.last().map(|a| a.error.to_string()).unwrap_or_default())]
    Exhausted {
        /// How many attempts were made.
        attempts: u32,
        /// Wall time spent across all attempts and backoff sleeps.
        elapsed: Duration,
        /// Every failed attempt, in order.
        history: Vec<Attempt<T::Error>>,
    },

    /// Request parameters could not be serialized.
    #[error("failed to serialize request parameters: {0}")]
    SerdeJson(serde_json::Error),
}

impl<T: JsonRpcClient> RetryClientError<T> {
    /// The terminal failure, when one exists.
    pub fn last_error(&self) -> Option<&T::Error> {
        match self {
            RetryClientError::Inner(err) => Some(err),
            RetryClientError::Exhausted { history, .. } => history.last().map(|a| &a.error),
            RetryClientError::SerdeJson(_) => None,
        }
    }
}

impl<T: JsonRpcClient> RpcError for RetryClientError<T> {
    fn as_error_response(&self) -> Option<&JsonRpcError> {
        self.last_error()?.as_error_response()
    }

    fn as_serde_error(&self) -> Option<&serde_json::Error> {
        match self {
            RetryClientError::SerdeJson(err) => Some(err),
            _ => self.last_error()?.as_serde_error(),
        }
    }

    fn is_transport_error(&self) -> bool {
        self.last_error().map(RpcError::is_transport_error).unwrap_or(false)
    }
}

impl<T> From<RetryClientError<T>> for ProviderError
where
    T: JsonRpcClient + 'static,
{
    fn from(src: RetryClientError<T>) -> Self {
        classify_client_error(src)
    }
}

#[async_trait]
impl<T> JsonRpcClient for RetryClient<T>
where
    T: JsonRpcClient + 'static,
{
    type Error = RetryClientError<T>;

    async fn request<A, R>(&self, method: &str, params: A) -> Result<R, Self::Error>
    where
        A: Debug + Serialize + Send + Sync,
        R: DeserializeOwned,
    {
        // serialize once so every attempt sees identical params
        let params = serde_json::to_value(params).map_err(RetryClientError::SerdeJson)?;

        let started = Instant::now();
        let mut history: Vec<Attempt<T::Error>> = Vec::new();

        for attempt in 1..=self.max_attempts {
            // hack to not hold `R` across an await in the sleep future and prevent requiring
            // R: Send + Sync
            let err;
            {
                let ret = self.inner.request(method, params.clone()).await;
                if let Ok(ret) = ret {
                    return Ok(ret)
                }
                err = ret.err().unwrap();
            }
            if !self.policy.should_retry(&err) {
                return Err(RetryClientError::Inner(err))
            }
            tracing::debug!(method, attempt, error = %err, "retryable failure");
            history.push(Attempt { after: started.elapsed(), error: err });
            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff.delay(attempt)).await;
            }
        }

        Err(RetryClientError::Exhausted {
            attempts: self.max_attempts,
            elapsed: started.elapsed(),
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MockProvider, MockResponse};
    use ethlink_core::types::U64;

    fn retryable_rpc_error() -> JsonRpcError {
        JsonRpcError { code: 429, message: "too many requests".to_string(), data: None }
    }

    #[test]
    fn backoff_is_geometric_then_capped() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            jitter: (0.0, 0.0),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(7), Duration::from_secs(5));
        assert_eq!(backoff.delay(30), Duration::from_secs(5));
    }

    #[test]
    fn backoff_jitter_stays_in_range() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            jitter: (0.10, 0.25),
        };
        for retry in 1..=8 {
            let nominal = Duration::from_millis(100 << (retry - 1)).min(Duration::from_secs(5));
            let delay = backoff.delay(retry);
            assert!(delay >= nominal.mul_f64(1.10), "delay {delay:?} below jitter floor");
            assert!(delay <= nominal.mul_f64(1.25), "delay {delay:?} above jitter ceiling");
        }
    }

    #[test]
    fn classifies_retryable_messages() {
        use crate::MockError;

        let policy = JsonRpcRetryPolicy;
        let retryable = |message: &str| {
            MockError::JsonRpcError(JsonRpcError {
                code: -32000,
                message: message.to_string(),
                data: None,
            })
        };

        assert!(policy.should_retry(&retryable("Too Many Requests")));
        assert!(policy.should_retry(&retryable("header not found")));
        assert!(policy.should_retry(&retryable("nonce too low: next nonce 3")));
        assert!(policy.should_retry(&retryable("the server is overloaded")));
        assert!(!policy.should_retry(&retryable("insufficient funds for gas * price + value")));
        assert!(!policy.should_retry(&retryable("execution reverted")));
    }

    #[tokio::test]
    async fn retries_rate_limited_requests_until_success() {
        // two transient failures, then a success
        let mock = MockProvider::new();
        mock.push(U64::from(2)).unwrap();
        mock.push_response(MockResponse::Error(retryable_rpc_error()));
        mock.push_response(MockResponse::Error(retryable_rpc_error()));

        let backoff = Backoff {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(100),
            jitter: (0.0, 0.0),
        };
        let client = RetryClientBuilder::default()
            .max_attempts(3)
            .backoff(backoff)
            .build(mock, Box::new(JsonRpcRetryPolicy));

        let started = Instant::now();
        let res: U64 = client.request("eth_blockNumber", ()).await.unwrap();
        assert_eq!(res.as_u64(), 2);
        // first retry sleeps 10ms, second 20ms
        assert!(started.elapsed() >= Duration::from_millis(30));

        for _ in 0..3 {
            client.inner().assert_request("eth_blockNumber", ()).unwrap();
        }
    }

    #[tokio::test]
    async fn reverts_are_not_retried() {
        let mock = MockProvider::new();
        mock.push_response(MockResponse::Error(JsonRpcError {
            code: 3,
            message: "execution reverted".to_string(),
            data: Some(serde_json::json!(
                "0x08c379a000000000000000000000000000000000000000000000000000000000000000200000000000000000000000000000000000000000000000000000000000000003626164"
            )),
        }));

        let client = RetryClientBuilder::default()
            .max_attempts(3)
            .build(mock, Box::new(JsonRpcRetryPolicy));

        let err = client.request::<_, U64>("eth_call", ()).await.unwrap_err();
        assert!(matches!(err, RetryClientError::Inner(_)));

        // exactly one attempt was made
        client.inner().assert_request("eth_call", ()).unwrap();
        assert!(client.inner().assert_request("eth_call", ()).is_err());

        // and it surfaces as a revert at the provider level
        assert!(matches!(ProviderError::from(err), ProviderError::Revert(_)));
    }

    #[tokio::test]
    async fn exhaustion_carries_full_history() {
        let mock = MockProvider::new();
        for _ in 0..3 {
            mock.push_response(MockResponse::Error(retryable_rpc_error()));
        }

        let backoff =
            Backoff { base: Duration::from_millis(1), cap: Duration::from_millis(4), jitter: (0.0, 0.0) };
        let client = RetryClientBuilder::default()
            .max_attempts(3)
            .backoff(backoff)
            .build(mock, Box::new(JsonRpcRetryPolicy));

        match client.request::<_, U64>("eth_blockNumber", ()).await.unwrap_err() {
            RetryClientError::Exhausted { attempts, history, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(history.len(), 3);
                assert!(history.windows(2).all(|w| w[0].after <= w[1].after));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_verbatim() {
        let mock = MockProvider::new();
        mock.push_response(MockResponse::Error(JsonRpcError {
            code: -32602,
            message: "invalid params".to_string(),
            data: None,
        }));

        let client = RetryClient::new(mock);
        let err = client.request::<_, U64>("eth_blockNumber", ()).await.unwrap_err();
        match err {
            RetryClientError::Inner(inner) => {
                assert_eq!(inner.as_error_response().unwrap().code, -32602)
            }
            other => panic!("expected inner error, got {other:?}"),
        }
    }
}
