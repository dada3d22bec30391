use crate::{
    errors::classify_client_error, JsonRpcClient, JsonRpcError, ProviderError, PubsubClient,
    RpcError,
};
use async_trait::async_trait;
use ethlink_core::types::U256;
use futures_channel::mpsc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{value::RawValue, Value};
use std::{
    borrow::Borrow,
    collections::{HashMap, VecDeque},
    fmt::Debug,
    sync::{Arc, Mutex},
};
use thiserror::Error;

/// Helper type that can be used to pass through the `params` value.
/// This is necessary because the wrapper provider is supposed to skip the `params` if it's of
/// size 0, see `crate::transports::common::Request`
#[derive(Debug)]
enum MockParams {
    Value(Value),
    Zst,
}

/// Helper response type for `MockProvider`, allowing custom JSON-RPC errors to be provided.
/// `Value` for successful responses, `Error` for JSON-RPC errors.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Successful response with a `serde_json::Value`.
    Value(Value),

    /// Error response with a `JsonRpcError`.
    Error(JsonRpcError),
}

#[derive(Clone, Debug)]
/// Mock transport used in test environments.
///
/// Responses behave like a stack: the most recently pushed response answers
/// the next request.
pub struct MockProvider {
    requests: Arc<Mutex<VecDeque<(String, MockParams)>>>,
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    notifications: Arc<Mutex<HashMap<U256, mpsc::UnboundedSender<Box<RawValue>>>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JsonRpcClient for MockProvider {
    type Error = MockError;

    /// Pushes the `(method, params)` to the back of the `requests` queue,
    /// pops the responses from the back of the `responses` queue
    async fn request<T: Debug + Serialize + Send + Sync, R: DeserializeOwned>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, MockError> {
        let params = if std::mem::size_of::<T>() == 0 {
            MockParams::Zst
        } else {
            MockParams::Value(serde_json::to_value(params)?)
        };
        self.requests.lock().unwrap().push_back((method.to_owned(), params));
        let mut data = self.responses.lock().unwrap();
        let element = data.pop_back().ok_or(MockError::EmptyResponses)?;
        match element {
            MockResponse::Value(value) => {
                let res: R = serde_json::from_value(value)?;
                Ok(res)
            }
            MockResponse::Error(error) => Err(MockError::JsonRpcError(error)),
        }
    }
}

impl PubsubClient for MockProvider {
    type NotificationStream = mpsc::UnboundedReceiver<Box<RawValue>>;

    fn subscribe<T: Into<U256>>(&self, id: T) -> Result<Self::NotificationStream, Self::Error> {
        let (tx, rx) = mpsc::unbounded();
        self.notifications.lock().unwrap().insert(id.into(), tx);
        Ok(rx)
    }

    fn unsubscribe<T: Into<U256>>(&self, id: T) -> Result<(), Self::Error> {
        self.notifications.lock().unwrap().remove(&id.into());
        Ok(())
    }
}

impl MockProvider {
    /// Instantiates a mock transport
    pub fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(VecDeque::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            notifications: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Checks that the provided request was submitted by the client
    pub fn assert_request<T: Serialize + Send + Sync>(
        &self,
        method: &str,
        data: T,
    ) -> Result<(), MockError> {
        let (m, inp) = self.requests.lock().unwrap().pop_front().ok_or(MockError::EmptyRequests)?;
        assert_eq!(m, method);
        assert!(!matches!(inp, MockParams::Value(Value::Null)));
        if std::mem::size_of::<T>() == 0 {
            assert!(matches!(inp, MockParams::Zst));
        } else if let MockParams::Value(inp) = inp {
            assert_eq!(serde_json::to_value(data).expect("could not serialize data"), inp);
        } else {
            unreachable!("Zero sized types must be denoted with MockParams::Zst")
        }

        Ok(())
    }

    /// Returns the number of requests recorded so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Pushes the data to the responses
    pub fn push<T: Serialize + Send + Sync, K: Borrow<T>>(&self, data: K) -> Result<(), MockError> {
        let value = serde_json::to_value(data.borrow())?;
        self.responses.lock().unwrap().push_back(MockResponse::Value(value));
        Ok(())
    }

    /// Pushes the data or error to the responses
    pub fn push_response(&self, response: MockResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Delivers a notification to the stream registered for `id`, if any.
    /// Returns whether a listener received it.
    pub fn push_notification<T: Serialize>(&self, id: U256, data: &T) -> Result<bool, MockError> {
        let raw = serde_json::value::to_raw_value(data)?;
        match self.notifications.lock().unwrap().get(&id) {
            Some(tx) => Ok(tx.unbounded_send(raw).is_ok()),
            None => Ok(false),
        }
    }
}

#[derive(Error, Debug)]
/// Errors for the `MockProvider`
pub enum MockError {
    /// (De)Serialization error
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    /// Empty requests array
    #[error("empty requests array, please push some requests")]
    EmptyRequests,

    /// Empty responses array
    #[error("empty responses array, please push some responses")]
    EmptyResponses,

    /// Custom JsonRpcError
    #[error("JSON-RPC error: {0}")]
    JsonRpcError(JsonRpcError),
}

impl RpcError for MockError {
    fn as_error_response(&self) -> Option<&JsonRpcError> {
        match self {
            MockError::JsonRpcError(e) => Some(e),
            _ => None,
        }
    }

    fn as_serde_error(&self) -> Option<&serde_json::Error> {
        match self {
            MockError::SerdeJson(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MockError> for ProviderError {
    fn from(src: MockError) -> Self {
        classify_client_error(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Provider;
    use ethlink_core::types::U64;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn pushes_request_and_response() {
        let mock = MockProvider::new();
        mock.push(U64::from(12)).unwrap();
        let block: U64 = mock.request("eth_blockNumber", ()).await.unwrap();
        mock.assert_request("eth_blockNumber", ()).unwrap();
        assert_eq!(block.as_u64(), 12);
    }

    #[tokio::test]
    async fn empty_responses() {
        let mock = MockProvider::new();
        // tries to get a response without pushing a response
        let err = mock.request::<_, ()>("eth_blockNumber", ()).await.unwrap_err();
        match err {
            MockError::EmptyResponses => {}
            _ => panic!("expected empty responses"),
        };
    }

    #[tokio::test]
    async fn pushes_error_response() {
        let mock = MockProvider::new();
        let error = JsonRpcError {
            code: 3,
            data: Some(serde_json::from_str(r#""0x556f1830...""#).unwrap()),
            message: "execution reverted".to_string(),
        };
        mock.push_response(MockResponse::Error(error.clone()));

        let result: Result<U64, MockError> = mock.request("eth_blockNumber", ()).await;
        match result {
            Err(MockError::JsonRpcError(e)) => {
                assert_eq!(e.code, error.code);
                assert_eq!(e.message, error.message);
                assert_eq!(e.data, error.data);
            }
            _ => panic!("Expected JsonRpcError"),
        }
    }

    #[tokio::test]
    async fn empty_requests() {
        let mock = MockProvider::new();
        // tries to assert a request without making one
        let err = mock.assert_request("eth_blockNumber", ()).unwrap_err();
        match err {
            MockError::EmptyRequests => {}
            _ => panic!("expected empty request"),
        };
    }

    #[tokio::test]
    async fn composes_with_provider() {
        let (provider, mock) = Provider::mocked();

        mock.push(U64::from(12)).unwrap();
        let block = provider.get_block_number().await.unwrap();
        assert_eq!(block.as_u64(), 12);
    }

    #[tokio::test]
    async fn delivers_notifications_in_order() {
        let mock = MockProvider::new();
        let mut stream = PubsubClient::subscribe(&mock, U256::from(1)).unwrap();

        for n in 0u64..3 {
            assert!(mock.push_notification(U256::from(1), &n).unwrap());
        }

        for n in 0u64..3 {
            let raw = stream.next().await.unwrap();
            let got: u64 = serde_json::from_str(raw.get()).unwrap();
            assert_eq!(got, n);
        }
    }
}
