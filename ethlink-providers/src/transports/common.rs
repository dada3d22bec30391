// JSON-RPC 2.0 framing shared by the HTTP and WebSocket transports.

use base64::{engine::general_purpose, Engine};
use ethlink_core::types::Bytes;
use serde::{
    de::{self, IgnoredAny, MapAccess, Unexpected, Visitor},
    Deserialize, Serialize,
};
use serde_json::{
    value::{to_raw_value, RawValue},
    Value,
};
use std::fmt;
use thiserror::Error;

/// A JSON-RPC 2.0 error
#[derive(Deserialize, Debug, Clone, Error)]
pub struct JsonRpcError {
    /// The error code
    pub code: i64,
    /// The error message
    pub message: String,
    /// Additional data
    pub data: Option<Value>,
}

/// Recursively traverses the value, looking for hex data that it can extract.
///
/// Inspired by ethers-js logic:
/// <https://github.com/ethers-io/ethers.js/blob/9f990c57f0486728902d4b8e049536f2bb3487ee/packages/providers/src.ts/json-rpc-provider.ts#L25-L53>
fn spelunk_revert(value: &Value) -> Option<Bytes> {
    match value {
        Value::String(s) if looks_like_revert_data(s) => s.parse().ok(),
        Value::String(_) => None,
        Value::Object(o) => o.values().flat_map(spelunk_revert).next(),
        _ => None,
    }
}

/// Revert payloads are `0x`-prefixed and longer than a bare 4-byte selector.
fn looks_like_revert_data(s: &str) -> bool {
    s.starts_with("0x") && s.len() > 10
}

impl JsonRpcError {
    /// Extracts revert bytes from the error's `data` field, if its shape
    /// matches what nodes attach to `eth_call`/`eth_estimateGas` reverts.
    ///
    /// This returns the first sufficiently long hex string found in the data
    /// object. Note that this may return false positives when called on
    /// errors from other RPC requests.
    pub fn revert_data(&self) -> Option<Bytes> {
        spelunk_revert(self.data.as_ref()?)
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(code: {}, message: {}, data: {:?})", self.code, self.message, self.data)
    }
}

fn is_zst<T>(_t: &T) -> bool {
    std::mem::size_of::<T>() == 0
}

#[derive(Serialize, Deserialize, Debug)]
/// A JSON-RPC request
pub struct Request<'a, T> {
    id: u64,
    jsonrpc: &'a str,
    method: &'a str,
    #[serde(skip_serializing_if = "is_zst")]
    params: T,
}

impl<'a, T> Request<'a, T> {
    /// Creates a new JSON RPC request
    pub fn new(id: u64, method: &'a str, params: T) -> Self {
        Self { id, jsonrpc: "2.0", method, params }
    }
}

/// Packs already-serialized request frames into a single JSON array frame.
#[cfg(feature = "ws")]
pub(crate) fn serialize_batch(
    requests: &[Box<RawValue>],
) -> Result<Box<RawValue>, serde_json::Error> {
    to_raw_value(&requests)
}

/// A response `id`, normalized to `u64`.
///
/// The JSON-RPC 2.0 spec allows servers to echo ids back as strings; some
/// gateways do, in decimal or `0x`-hex form.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResponseId(pub(crate) u64);

impl<'de> Deserialize<'de> for ResponseId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct IdVisitor;
        impl Visitor<'_> for IdVisitor {
            type Value = ResponseId;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a request id as an unsigned integer or a string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ResponseId(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(ResponseId)
                    .map_err(|_| de::Error::invalid_value(Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let parsed = match v.strip_prefix("0x") {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => v.parse(),
                };
                parsed.map(ResponseId).map_err(|_| de::Error::invalid_value(Unexpected::Str(v), &self))
            }
        }
        deserializer.deserialize_any(IdVisitor)
    }
}

/// A JSON-RPC response frame
#[derive(Debug)]
pub enum Response<'a> {
    /// A response carrying a `result`
    Success {
        /// The id of the request this responds to
        id: u64,
        /// The raw result payload
        result: &'a RawValue,
    },
    /// A response carrying an `error`
    Error {
        /// The id of the request this responds to
        id: u64,
        /// The error object
        error: JsonRpcError,
    },
    /// A server-push notification without an id
    Notification {
        /// The notification method, `eth_subscription` for subscriptions
        method: &'a str,
        /// The notification payload
        params: Params<'a>,
    },
}

/// Parameters of an `eth_subscription` notification
#[derive(Deserialize, Debug)]
pub struct Params<'a> {
    /// The server-assigned subscription id
    pub subscription: ethlink_core::types::U256,
    /// The raw notification payload
    #[serde(borrow)]
    pub result: &'a RawValue,
}

// FIXME: ideally, this could be auto-derived as an untagged enum, but due to
// https://github.com/serde-rs/serde/issues/1183 this currently fails
impl<'de: 'a, 'a> Deserialize<'de> for Response<'a> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ResponseVisitor<'a>(&'a ());
        impl<'de: 'a, 'a> Visitor<'de> for ResponseVisitor<'a> {
            type Value = Response<'a>;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a valid jsonrpc 2.0 response object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
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
                                return Err(de::Error::invalid_value(Unexpected::Str(value), &"2.0"))
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

                            let value: &RawValue = map.next_value()?;
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

                            let value: &str = map.next_value()?;
                            method = Some(value);
                        }
                        "params" => {
                            if params.is_some() {
                                return Err(de::Error::duplicate_field("params"))
                            }

                            let value: Params<'_> = map.next_value()?;
                            params = Some(value);
                        }
                        // servers are free to attach extension fields
                        _ => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                // jsonrpc version must be present in all responses
                if !jsonrpc {
                    return Err(de::Error::missing_field("jsonrpc"))
                }

                match (id, result, error, method, params) {
                    (Some(id), Some(result), None, None, None) => {
                        Ok(Response::Success { id, result })
                    }
                    (Some(id), None, Some(error), None, None) => Ok(Response::Error { id, error }),
                    (None, None, None, Some(method), Some(params)) => {
                        Ok(Response::Notification { method, params })
                    }
                    _ => Err(de::Error::custom(
                        "response must be either a success/error or notification object",
                    )),
                }
            }
        }

        deserializer.deserialize_map(ResponseVisitor(&()))
    }
}

/// Basic or bearer authentication in http or websocket transport
///
/// Use to inject username and password or an auth token into requests
#[derive(Clone, Debug)]
pub enum Authorization {
    /// HTTP Basic Auth
    Basic(String),
    /// Bearer Auth
    Bearer(String),
    /// If you need to override the Authorization header value
    Raw(String),
}

impl Authorization {
    /// Make a new basic auth
    pub fn basic(username: impl AsRef<str>, password: impl AsRef<str>) -> Self {
        let username = username.as_ref();
        let password = password.as_ref();
        let auth_secret = general_purpose::STANDARD.encode(format!("{username}:{password}"));
        Self::Basic(auth_secret)
    }

    /// Make a new bearer auth
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    /// Override the Authorization header with your own string
    pub fn raw(token: impl Into<String>) -> Self {
        Self::Raw(token.into())
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authorization::Basic(auth_secret) => write!(f, "Basic {auth_secret}"),
            Authorization::Bearer(token) => write!(f, "Bearer {token}"),
            Authorization::Raw(s) => write!(f, "{s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethlink_core::types::U64;

    #[test]
    fn deser_response() {
        let _ =
            serde_json::from_str::<Response<'_>>(r#"{"jsonrpc":"2.0","result":19}"#).unwrap_err();
        let _ = serde_json::from_str::<Response<'_>>(r#"{"jsonrpc":"3.0","result":19,"id":1}"#)
            .unwrap_err();

        let response: Response<'_> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","result":19,"id":1}"#).unwrap();

        match response {
            Response::Success { id, result } => {
                assert_eq!(id, 1);
                let result: u64 = serde_json::from_str(result.get()).unwrap();
                assert_eq!(result, 19);
            }
            _ => panic!("expected `Success` response"),
        }

        let response: Response<'_> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","error":{"code":-32000,"message":"error occurred"},"id":2}"#,
        )
        .unwrap();

        match response {
            Response::Error { id, error } => {
                assert_eq!(id, 2);
                assert_eq!(error.code, -32000);
                assert_eq!(error.message, "error occurred");
                assert!(error.data.is_none());
            }
            _ => panic!("expected `Error` response"),
        }

        let response: Response<'_> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","result":"0xfa","id":0}"#).unwrap();

        match response {
            Response::Success { id, result } => {
                assert_eq!(id, 0);
                let result: U64 = serde_json::from_str(result.get()).unwrap();
                assert_eq!(result.as_u64(), 250);
            }
            _ => panic!("expected `Success` response"),
        }
    }

    #[test]
    fn deser_response_with_string_ids() {
        let response: Response<'_> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","result":1,"id":"42"}"#).unwrap();
        assert!(matches!(response, Response::Success { id: 42, .. }));

        let response: Response<'_> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","result":1,"id":"0x2a"}"#).unwrap();
        assert!(matches!(response, Response::Success { id: 42, .. }));
    }

    #[test]
    fn deser_response_tolerates_extension_fields() {
        let response: Response<'_> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","result":1,"id":7,"vendor":{"traceId":"abc"}}"#,
        )
        .unwrap();
        assert!(matches!(response, Response::Success { id: 7, .. }));
    }

    #[test]
    fn deser_response_rejects_result_and_error() {
        let res = serde_json::from_str::<Response<'_>>(
            r#"{"jsonrpc":"2.0","result":1,"error":{"code":1,"message":"m"},"id":7}"#,
        );
        assert!(res.is_err());

        // an error object must carry code and message
        let res =
            serde_json::from_str::<Response<'_>>(r#"{"jsonrpc":"2.0","error":{"code":1},"id":7}"#);
        assert!(res.is_err());
    }

    #[test]
    fn ser_request() {
        let request: Request<'_, ()> = Request::new(0, "eth_chainId", ());
        assert_eq!(
            &serde_json::to_string(&request).unwrap(),
            r#"{"id":0,"jsonrpc":"2.0","method":"eth_chainId"}"#
        );

        let request: Request<'_, ()> = Request::new(300, "method_name", ());
        assert_eq!(
            &serde_json::to_string(&request).unwrap(),
            r#"{"id":300,"jsonrpc":"2.0","method":"method_name"}"#
        );

        let request: Request<'_, u32> = Request::new(300, "method_name", 1);
        assert_eq!(
            &serde_json::to_string(&request).unwrap(),
            r#"{"id":300,"jsonrpc":"2.0","method":"method_name","params":1}"#
        );
    }

    #[test]
    fn revert_data_is_shape_checked() {
        let mk = |data: Option<Value>| JsonRpcError {
            code: 3,
            message: "execution reverted".to_string(),
            data,
        };

        // too short to be revert bytes: a bare selector or less
        assert!(mk(Some(Value::String("0x08c379a0".into()))).revert_data().is_none());
        assert!(mk(None).revert_data().is_none());

        // long enough, including nested inside vendor objects
        let long = "0x08c379a00000000000000000000000000000000000000000000000000000000000000020";
        assert!(mk(Some(Value::String(long.into()))).revert_data().is_some());
        assert!(mk(Some(serde_json::json!({ "originalError": { "data": long } })))
            .revert_data()
            .is_some());
    }
}
