use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use ethlink_core::types::U256;
use futures_channel::{mpsc, oneshot};
use serde::{de, Deserialize};
use serde_json::value::{to_raw_value, RawValue};

use crate::{
    transports::common::{Request, ResponseId},
    JsonRpcError, Metrics,
};

/// Completion payload for one in-flight request.
pub(super) type Response = Result<Box<RawValue>, RequestError>;

/// Why a pending request completed without a success response.
#[derive(Debug)]
pub(super) enum RequestError {
    /// The server answered with an error response.
    Rpc(JsonRpcError),
    /// The timeout sweeper expired the request.
    Timeout,
    /// The transport was closed while the request was pending.
    Cancelled,
    /// The socket went away while the request was in flight. Requests are
    /// never replayed across reconnects.
    ConnectionLost,
    /// The pending table is at capacity.
    Backpressure {
        /// Number of requests currently awaiting a response.
        pending: usize,
        /// The configured capacity.
        max: usize,
    },
}

/// What a producer does when the instruction queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Await queue capacity; the producer task is parked until the I/O task
    /// drains the queue.
    Blocking,
    /// Spin on `try_send`, yielding to the scheduler between attempts.
    Yielding,
}

/// Tuning knobs for the WebSocket transport.
#[derive(Clone, Debug)]
pub struct WsConfig {
    /// How long a request may stay pending before the sweeper expires it.
    pub request_timeout: Duration,
    /// How often the sweeper scans the pending table.
    pub sweep_interval: Duration,
    /// Capacity of the pending-request table. Must be a nonzero power of
    /// two; requests beyond it fail fast with a backpressure error.
    pub max_pending: usize,
    /// Reconnection attempts per outage before the transport shuts down.
    pub max_reconnects: usize,
    /// Initial reconnection backoff delay.
    pub reconnect_base: Duration,
    /// Reconnection backoff cap.
    pub reconnect_max: Duration,
    /// Capacity of the producer-side instruction queue.
    pub instruction_buffer: usize,
    /// Producer behavior when the instruction queue is full.
    pub wait_strategy: WaitStrategy,
    /// Observability sink.
    pub metrics: Arc<dyn Metrics>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(500),
            max_pending: 65_536,
            max_reconnects: 5,
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(5),
            instruction_buffer: 1024,
            wait_strategy: WaitStrategy::Blocking,
            metrics: crate::metrics::noop(),
        }
    }
}

impl WsConfig {
    pub(super) fn validate(&self) -> Result<(), super::WsClientError> {
        if self.max_pending == 0 || !self.max_pending.is_power_of_two() {
            return Err(super::WsClientError::InvalidConfig(
                "max_pending must be a nonzero power of two",
            ))
        }
        if self.instruction_buffer == 0 {
            return Err(super::WsClientError::InvalidConfig("instruction_buffer must be nonzero"))
        }
        if self.request_timeout.is_zero() || self.sweep_interval.is_zero() {
            return Err(super::WsClientError::InvalidConfig(
                "request_timeout and sweep_interval must be positive",
            ))
        }
        Ok(())
    }
}

#[derive(serde::Deserialize, serde::Serialize)]
pub(super) struct SubId(pub U256);

#[derive(Deserialize, Debug, Clone)]
pub(super) struct Notification {
    pub subscription: U256,
    pub result: Box<RawValue>,
}

#[derive(Debug, Clone)]
pub(super) enum PubSubItem {
    Success { id: u64, result: Box<RawValue> },
    Error { id: u64, error: JsonRpcError },
    Notification { params: Notification },
}

// FIXME: ideally, this could be auto-derived as an untagged enum, but due to
// https://github.com/serde-rs/serde/issues/1183 this currently fails
impl<'de> Deserialize<'de> for PubSubItem {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ResponseVisitor;
        impl<'de> de::Visitor<'de> for ResponseVisitor {
            type Value = PubSubItem;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a valid jsonrpc 2.0 response object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut jsonrpc = false;

                // response & error
                let mut id = None;
                // only response
                let mut result = None;
                // only error
                let mut error = None;
                // only notification
                let mut method = None;
                let mut params = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        "jsonrpc" => {
                            if jsonrpc {
                                return Err(de::Error::duplicate_field("jsonrpc"))
                            }

                            let value = map.next_value()?;
                            if value != "2.0" {
                                return Err(de::Error::invalid_value(
                                    de::Unexpected::Str(value),
                                    &"2.0",
                                ))
                            }

                            jsonrpc = true;
                        }
                        "id" => {
                            if id.is_some() {
                                return Err(de::Error::duplicate_field("id"))
                            }

                            let value: ResponseId = map.next_value()?;
                            id = Some(value.0);
                        }
                        "result" => {
                            if result.is_some() {
                                return Err(de::Error::duplicate_field("result"))
                            }

                            let value: Box<RawValue> = map.next_value()?;
                            result = Some(value);
                        }
                        "error" => {
                            if error.is_some() {
                                return Err(de::Error::duplicate_field("error"))
                            }

                            let value: JsonRpcError = map.next_value()?;
                            error = Some(value);
                        }
                        "method" => {
                            if method.is_some() {
                                return Err(de::Error::duplicate_field("method"))
                            }

                            let value: String = map.next_value()?;
                            method = Some(value);
                        }
                        "params" => {
                            if params.is_some() {
                                return Err(de::Error::duplicate_field("params"))
                            }

                            let value: Notification = map.next_value()?;
                            params = Some(value);
                        }
                        // servers are free to attach extension fields
                        _ => {
                            map.next_value::<de::IgnoredAny>()?;
                        }
                    }
                }

                // jsonrpc version must be present in all responses
                if !jsonrpc {
                    return Err(de::Error::missing_field("jsonrpc"))
                }

                match (id, result, error, method, params) {
                    (Some(id), Some(result), None, None, None) => {
                        Ok(PubSubItem::Success { id, result })
                    }
                    (Some(id), None, Some(error), None, None) => {
                        Ok(PubSubItem::Error { id, error })
                    }
                    (None, None, None, Some(_), Some(params)) => {
                        Ok(PubSubItem::Notification { params })
                    }
                    _ => Err(de::Error::custom(
                        "response must be either a success/error or notification object",
                    )),
                }
            }
        }

        deserializer.deserialize_map(ResponseVisitor)
    }
}

impl fmt::Display for PubSubItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PubSubItem::Success { id, .. } => write!(f, "Req success. ID: {id}"),
            PubSubItem::Error { id, .. } => write!(f, "Req error. ID: {id}"),
            PubSubItem::Notification { params } => {
                write!(f, "Notification for sub: {:?}", params.subscription)
            }
        }
    }
}

/// The URL and optional authorization for a WebSocket connection.
#[derive(Debug, Clone)]
pub struct ConnectionDetails {
    /// The websocket endpoint.
    pub url: String,
    /// Credentials injected into the handshake request.
    pub auth: Option<crate::Authorization>,
}

impl ConnectionDetails {
    /// Instantiates connection details for the given endpoint and
    /// credentials.
    pub fn new(url: impl AsRef<str>, auth: Option<crate::Authorization>) -> Self {
        Self { url: url.as_ref().to_string(), auth }
    }
}

impl<T> From<T> for ConnectionDetails
where
    T: AsRef<str>,
{
    fn from(value: T) -> Self {
        ConnectionDetails { url: value.as_ref().to_string(), auth: None }
    }
}

#[derive(Debug)]
pub(super) struct InFlight {
    pub method: String,
    pub params: Box<RawValue>,
    pub started: Instant,
    pub channel: oneshot::Sender<Response>,
}

impl InFlight {
    pub(super) fn to_request(&self, id: u64) -> Request<'_, Box<RawValue>> {
        Request::new(id, &self.method, self.params.clone())
    }

    pub(super) fn serialize_raw(&self, id: u64) -> Result<Box<RawValue>, serde_json::Error> {
        to_raw_value(&self.to_request(id))
    }
}

#[derive(Debug)]
pub(super) struct ActiveSub {
    pub params: Box<RawValue>,
    pub channel: mpsc::UnboundedSender<Box<RawValue>>,
    pub current_server_id: Option<U256>,
}

impl ActiveSub {
    pub(super) fn to_request(&self, id: u64) -> Request<'static, Box<RawValue>> {
        Request::new(id, "eth_subscribe", self.params.clone())
    }

    pub(super) fn serialize_raw(&self, id: u64) -> Result<Box<RawValue>, serde_json::Error> {
        to_raw_value(&self.to_request(id))
    }
}

/// Instructions for the `RequestManager`.
pub(super) enum Instruction {
    /// JSON-RPC request
    Request { method: String, params: Box<RawValue>, sender: oneshot::Sender<Response> },
    /// Several requests packed into a single array frame. Senders correlate
    /// positionally with the requests.
    BatchRequest {
        requests: Vec<(String, Box<RawValue>)>,
        senders: Vec<oneshot::Sender<Response>>,
    },
    /// Cancel an existing subscription. The listener is removed
    /// unconditionally; the server's ack is delivered to `sender`.
    Unsubscribe { id: U256, sender: oneshot::Sender<Response> },
    /// Graceful shutdown: drain in-flight work, then fail the rest.
    Close,
}

mod aliases {
    pub use tokio_tungstenite::{
        connect_async,
        tungstenite::{self, protocol::CloseFrame},
    };
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    pub type Message = tungstenite::protocol::Message;
    pub type WsError = tungstenite::Error;
    pub type WsStreamItem = Result<Message, WsError>;

    pub use http::Request as HttpRequest;
    pub use tungstenite::client::IntoClientRequest;

    pub type InternalStream =
        futures_util::stream::Fuse<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

    impl IntoClientRequest for super::ConnectionDetails {
        fn into_client_request(
            self,
        ) -> tungstenite::Result<tungstenite::handshake::client::Request> {
            let mut request: HttpRequest<()> = self.url.into_client_request()?;
            if let Some(auth) = self.auth {
                let mut auth_value = http::HeaderValue::from_str(&auth.to_string())?;
                auth_value.set_sensitive(true);

                request.headers_mut().insert(http::header::AUTHORIZATION, auth_value);
            }

            request.into_client_request()
        }
    }
}

pub(super) use aliases::*;
