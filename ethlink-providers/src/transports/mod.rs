mod common;
pub use common::{Authorization, JsonRpcError, Params, Request, Response};

mod http;
pub use self::http::{ClientError as HttpClientError, HttpConfig, Provider as Http};

#[cfg(feature = "ws")]
mod ws;
#[cfg(feature = "ws")]
pub use ws::{ConnectionDetails, WaitStrategy, WsClient, WsClientError, WsConfig};

mod retry;
pub use retry::{
    Attempt, Backoff, JsonRpcRetryPolicy, RetryClient, RetryClientBuilder, RetryClientError,
    RetryPolicy, TransportOnlyRetryPolicy,
};

mod mock;
pub use mock::{MockError, MockProvider, MockResponse};
