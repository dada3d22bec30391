// A one-shot JSON-RPC transport over HTTP(S): exactly one network attempt
// per call, retry is the caller's concern.

use super::common::{Authorization, JsonRpcError, Request, Response};
use crate::{errors::classify_client_error, JsonRpcClient, Metrics, ProviderError, RpcError};
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION},
    Client, Error as ReqwestError,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    fmt::Debug,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use url::Url;

/// Configuration for the HTTP transport.
///
/// The URL scheme is validated eagerly when the client is built; both
/// timeouts must be positive. Headers are applied to every request in
/// insertion order.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// The endpoint to POST request frames to. Must be http or https.
    pub url: Url,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-request read timeout.
    pub read_timeout: Duration,
    /// Static headers attached to every request.
    pub headers: Vec<(String, String)>,
    /// Observability sink.
    pub metrics: Arc<dyn Metrics>,
}

impl HttpConfig {
    /// Default configuration for the given endpoint: 10 s connect timeout,
    /// 60 s read timeout, no extra headers.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            headers: Vec::new(),
            metrics: crate::metrics::noop(),
        }
    }
}

/// A low-level JSON-RPC Client over HTTP.
///
/// # Example
///
/// ```no_run
/// use ethlink_core::types::U64;
/// use ethlink_providers::{JsonRpcClient, Http};
/// use std::str::FromStr;
///
/// # async fn foo() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = Http::from_str("http://localhost:8545")?;
/// let block_number: U64 = provider.request("eth_blockNumber", ()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Provider {
    id: AtomicU64,
    client: Client,
    url: Url,
    metrics: Arc<dyn Metrics>,
}

#[derive(Error, Debug)]
/// Error thrown when building the client or sending an HTTP request
pub enum ClientError {
    /// Thrown if the request failed
    #[error(transparent)]
    ReqwestError(#[from] ReqwestError),

    /// Thrown on a JSON-RPC error response, or a non-2xx HTTP status (which
    /// is mapped to code `-32001` with the response body as `data`)
    #[error(transparent)]
    JsonRpcError(#[from] JsonRpcError),

    #[error("Deserialization Error: {err}. Response: {text}")]
    /// Serde JSON Error
    SerdeJson {
        /// Underlying error
        err: serde_json::Error,
        /// The contents of the HTTP response that could not be deserialized
        text: String,
    },

    /// Thrown if the configured URL is not http or https
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// Thrown if the endpoint URL cannot be parsed
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    /// Thrown if a configured header name or value is invalid
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

impl From<ClientError> for ProviderError {
    fn from(src: ClientError) -> Self {
        match src {
            ClientError::ReqwestError(err) => ProviderError::HTTPError(err),
            _ => classify_client_error(src),
        }
    }
}

impl RpcError for ClientError {
    fn as_error_response(&self) -> Option<&JsonRpcError> {
        if let ClientError::JsonRpcError(err) = self {
            Some(err)
        } else {
            None
        }
    }

    fn as_serde_error(&self) -> Option<&serde_json::Error> {
        match self {
            ClientError::SerdeJson { err, .. } => Some(err),
            _ => None,
        }
    }

    fn is_transport_error(&self) -> bool {
        matches!(self, ClientError::ReqwestError(_))
    }
}

#[async_trait]
impl JsonRpcClient for Provider {
    type Error = ClientError;

    async fn request<T: Debug + Serialize + Send + Sync, R: DeserializeOwned>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, ClientError> {
        let next_id = self.id.fetch_add(1, Ordering::SeqCst);
        let payload = Request::new(next_id, method, params);

        self.metrics.on_request_started(method);
        let started = Instant::now();

        let res = match self.client.post(self.url.as_ref()).json(&payload).send().await {
            Ok(res) => res,
            Err(err) => {
                self.metrics.on_request_failed(method, &err.to_string());
                return Err(err.into())
            }
        };
        let status = res.status();
        let body = res.bytes().await?;

        if !status.is_success() {
            let error = JsonRpcError {
                code: -32001,
                message: format!("HTTP error {status}"),
                data: Some(Value::String(String::from_utf8_lossy(&body).into_owned())),
            };
            self.metrics.on_request_failed(method, &error.message);
            return Err(error.into())
        }

        let raw = match serde_json::from_slice(&body) {
            Ok(Response::Success { result, .. }) => result.to_owned(),
            Ok(Response::Error { error, .. }) => {
                self.metrics.on_request_failed(method, &error.message);
                return Err(error.into())
            }
            Ok(_) => {
                let err = ClientError::SerdeJson {
                    err: serde::de::Error::custom("unexpected notification over HTTP transport"),
                    text: String::from_utf8_lossy(&body).to_string(),
                };
                self.metrics.on_request_failed(method, "unexpected notification");
                return Err(err)
            }
            Err(err) => {
                self.metrics.on_request_failed(method, &err.to_string());
                return Err(ClientError::SerdeJson {
                    err,
                    text: String::from_utf8_lossy(&body).to_string(),
                })
            }
        };

        let res = serde_json::from_str(raw.get())
            .map_err(|err| ClientError::SerdeJson { err, text: raw.to_string() })?;

        self.metrics.on_request_completed(method, started.elapsed());
        Ok(res)
    }
}

impl Provider {
    /// Sends several calls as a single JSON array frame, returning the
    /// responses in input order. Correlation is by id: servers are free to
    /// answer a batch in any order.
    ///
    /// A call whose response is missing from the reply, or arrives
    /// malformed, fails individually; its neighbors are unaffected.
    pub async fn request_batch(
        &self,
        calls: Vec<(String, serde_json::Value)>,
    ) -> Result<Vec<Result<Box<serde_json::value::RawValue>, ClientError>>, ClientError> {
        let first_id = self.id.fetch_add(calls.len() as u64, Ordering::SeqCst);
        let frames: Vec<Request<'_, &serde_json::Value>> = calls
            .iter()
            .enumerate()
            .map(|(i, (method, params))| Request::new(first_id + i as u64, method, params))
            .collect();
        for (method, _) in &calls {
            self.metrics.on_request_started(method);
        }
        let started = Instant::now();

        let res = self.client.post(self.url.as_ref()).json(&frames).send().await?;
        let status = res.status();
        let body = res.bytes().await?;

        if !status.is_success() {
            return Err(ClientError::JsonRpcError(JsonRpcError {
                code: -32001,
                message: format!("HTTP error {status}"),
                data: Some(Value::String(String::from_utf8_lossy(&body).into_owned())),
            }))
        }

        let raw_items: Vec<&serde_json::value::RawValue> = serde_json::from_slice(&body)
            .map_err(|err| ClientError::SerdeJson {
                err,
                text: String::from_utf8_lossy(&body).to_string(),
            })?;

        let mut by_id = std::collections::HashMap::with_capacity(raw_items.len());
        for raw in raw_items {
            match serde_json::from_str::<Response<'_>>(raw.get()) {
                Ok(Response::Success { id, result }) => {
                    by_id.insert(id, Ok(result.to_owned()));
                }
                Ok(Response::Error { id, error }) => {
                    by_id.insert(id, Err(ClientError::JsonRpcError(error)));
                }
                // notifications and garbage cannot be correlated; the calls
                // they might have answered surface as missing below
                Ok(Response::Notification { .. }) | Err(_) => {}
            }
        }

        let results = calls
            .iter()
            .enumerate()
            .map(|(i, (method, _))| {
                let res = by_id.remove(&(first_id + i as u64)).unwrap_or_else(|| {
                    Err(ClientError::SerdeJson {
                        err: serde::de::Error::custom("no response for batched request"),
                        text: String::new(),
                    })
                });
                match &res {
                    Ok(_) => self.metrics.on_request_completed(method, started.elapsed()),
                    Err(err) => self.metrics.on_request_failed(method, &err.to_string()),
                }
                res
            })
            .collect();
        Ok(results)
    }

    /// Initializes a new HTTP Client with default timeouts. Fails eagerly
    /// when the URL scheme is not http or https, or the underlying client
    /// cannot be built.
    ///
    /// # Example
    ///
    /// ```
    /// use ethlink_providers::Http;
    /// use url::Url;
    ///
    /// let url = Url::parse("http://localhost:8545").unwrap();
    /// let provider = Http::new(url).unwrap();
    /// ```
    pub fn new(url: impl Into<Url>) -> Result<Self, ClientError> {
        Self::with_config(HttpConfig::new(url.into()))
    }

    /// Initializes a new HTTP Client from an [`HttpConfig`], validating the
    /// URL scheme and header set eagerly.
    pub fn with_config(config: HttpConfig) -> Result<Self, ClientError> {
        match config.url.scheme() {
            "http" | "https" => {}
            other => return Err(ClientError::UnsupportedScheme(other.to_string())),
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_str(name)
                .map_err(|e| ClientError::InvalidHeader(format!("{name}: {e}")))?;
            let mut value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::InvalidHeader(format!("{name}: {e}")))?;
            if name == AUTHORIZATION {
                value.set_sensitive(true);
            }
            headers.append(name, value);
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            id: AtomicU64::new(1),
            client,
            url: config.url,
            metrics: config.metrics,
        })
    }

    /// Initializes a new HTTP Client with authentication
    ///
    /// # Example
    ///
    /// ```
    /// use ethlink_providers::{Authorization, Http};
    /// use url::Url;
    ///
    /// let url = Url::parse("http://localhost:8545").unwrap();
    /// let provider = Http::new_with_auth(url, Authorization::basic("admin", "good_password"));
    /// ```
    pub fn new_with_auth(
        url: impl Into<Url>,
        auth: Authorization,
    ) -> Result<Self, ClientError> {
        let mut config = HttpConfig::new(url.into());
        config.headers.push(("authorization".to_string(), auth.to_string()));
        Self::with_config(config)
    }

    /// The Url to which requests are made
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Mutable access to the Url to which requests are made
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }
}

impl FromStr for Provider {
    type Err = ClientError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(src)?;
        Self::with_config(HttpConfig::new(url))
    }
}

impl Clone for Provider {
    fn clone(&self) -> Self {
        Self {
            id: AtomicU64::new(1),
            client: self.client.clone(),
            url: self.url.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serves exactly one HTTP request with the given JSON body.
    async fn serve_json_once(body: &'static str) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            // read the full request before answering
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length: "))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= header_end + 4 + content_length {
                        break
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn batch_responses_correlate_by_id_in_input_order() {
        // out-of-order reply, one error, one missing (id 3)
        let url = serve_json_once(
            r#"[
                {"jsonrpc":"2.0","id":2,"error":{"code":-32000,"message":"boom"}},
                {"jsonrpc":"2.0","id":1,"result":"0x1"}
            ]"#,
        )
        .await;

        let provider = Provider::new(url).unwrap();
        let calls = vec![
            ("eth_chainId".to_string(), serde_json::json!([])),
            ("eth_blockNumber".to_string(), serde_json::json!([])),
            ("eth_gasPrice".to_string(), serde_json::json!([])),
        ];
        let results = provider.request_batch(calls).await.unwrap();
        assert_eq!(results.len(), 3);

        assert_eq!(results[0].as_ref().unwrap().get(), r#""0x1""#);
        match &results[1] {
            Err(ClientError::JsonRpcError(err)) => assert_eq!(err.code, -32000),
            other => panic!("expected rpc error, got {other:?}"),
        }
        assert!(matches!(&results[2], Err(ClientError::SerdeJson { .. })));
    }

    #[test]
    fn rejects_non_http_schemes() {
        let cfg = HttpConfig::new(Url::parse("ws://localhost:8546").unwrap());
        match Provider::with_config(cfg) {
            Err(ClientError::UnsupportedScheme(s)) => assert_eq!(s, "ws"),
            other => panic!("expected scheme error, got {other:?}"),
        }

        // the plain constructor surfaces the same error instead of panicking
        let err = Provider::new(Url::parse("ws://localhost:8546").unwrap()).unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedScheme(_)));
    }

    #[test]
    fn rejects_malformed_headers() {
        let mut cfg = HttpConfig::new(Url::parse("http://localhost:8545").unwrap());
        cfg.headers.push(("x-api-key".to_string(), "bad\nvalue".to_string()));
        assert!(matches!(Provider::with_config(cfg), Err(ClientError::InvalidHeader(_))));
    }
}
