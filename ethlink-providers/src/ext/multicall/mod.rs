//! A batcher aggregating read-only contract calls into `aggregate3`
//! invocations against the [Multicall3 contract](https://github.com/mds1/multicall).
//!
//! Recording returns a typed [`BatchHandle`] directly:
//!
//! ```no_run
//! # async fn foo() -> Result<(), Box<dyn std::error::Error>> {
//! # use ethlink_providers::{Http, Multicall, Provider};
//! # use ethlink_core::types::{Address, Bytes};
//! # use std::{str::FromStr, sync::Arc};
//! let provider = Arc::new(Provider::new(Http::from_str("http://localhost:8545")?));
//! let multicall = Multicall::new(provider, None);
//!
//! let target = Address::repeat_byte(0x11);
//! // totalSupply()
//! let calldata = Bytes::from_str("0x18160ddd")?;
//! let supply = multicall.add_call(target, calldata, |data| {
//!     ethlink_core::ethabi::decode(&[ethlink_core::ethabi::ParamType::Uint(256)], data)
//! })?;
//!
//! multicall.execute().await?;
//! let tokens = supply.await?;
//! # Ok(())
//! # }
//! ```

pub mod constants;
use constants::{AGGREGATE3_SELECTOR, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MULTICALL_ADDRESS};

use crate::{JsonRpcClient, Provider, ProviderError, RevertError};
use ethlink_core::{
    ethabi::{self, Function, ParamType, StateMutability, Token},
    types::{Address, BlockNumber, Bytes, TransactionRequest},
};
use futures_channel::oneshot;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};
use thiserror::Error;

/// Errors produced while recording or executing a multicall batch.
#[derive(Debug, Clone, Error)]
pub enum MulticallError {
    /// `execute` was already called on this batch.
    #[error("batch has already been executed")]
    AlreadyExecuted,

    /// Only view and pure functions can be batched.
    #[error("function `{0}` is not view or pure")]
    NonViewFunction(String),

    /// The target accepted the call but returned nothing; an EOA behaves
    /// exactly like this.
    #[error("call returned empty data (target may not be a contract)")]
    EmptyReturnData,

    /// The individual call reverted.
    #[error(transparent)]
    Revert(#[from] RevertError),

    /// ABI encoding or decoding failed.
    #[error("abi error: {0}")]
    Abi(Arc<ethabi::Error>),

    /// The `eth_call` for the chunk containing this call failed.
    #[error(transparent)]
    Provider(Arc<ProviderError>),

    /// The batch was dropped before `execute` ran.
    #[error("batch was dropped before execution")]
    NeverExecuted,
}

impl From<ethabi::Error> for MulticallError {
    fn from(err: ethabi::Error) -> Self {
        MulticallError::Abi(Arc::new(err))
    }
}

/// Resolves with the decoded result of one batched call once the batch
/// executes.
///
/// Every handle completes exactly once; dropping a handle discards its
/// result without affecting the rest of the batch.
#[must_use = "a batch handle resolves nothing until the batch is executed"]
#[derive(Debug)]
pub struct BatchHandle<T> {
    rx: oneshot::Receiver<Result<T, MulticallError>>,
}

impl<T> Future for BatchHandle<T> {
    type Output = Result<T, MulticallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(MulticallError::NeverExecuted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

type CompleteFn = Box<dyn FnOnce(CallOutcome) + Send>;

enum CallOutcome {
    Success(Vec<u8>),
    Failure(MulticallError),
}

struct PendingCall {
    target: Address,
    calldata: Bytes,
    complete: CompleteFn,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("target", &self.target)
            .field("calldata", &self.calldata)
            .finish_non_exhaustive()
    }
}

/// Aggregates read-only calls into chunked `aggregate3` invocations.
///
/// Recording is guarded by a mutex and an executed flag: calls may be added
/// from one thread at a time, and a batch executes exactly once. Individual
/// call failures (reverts, empty return data) complete their own handle;
/// they never poison sibling calls.
#[must_use = "Multicall does nothing unless you record calls and `execute`"]
#[derive(Debug)]
pub struct Multicall<P> {
    provider: Arc<Provider<P>>,
    address: Address,
    chunk_size: usize,
    block: Option<BlockNumber>,
    calls: Mutex<Vec<PendingCall>>,
    executed: AtomicBool,
}

impl<P: JsonRpcClient> Multicall<P> {
    /// Creates a batcher dispatching through `provider`, against the given
    /// aggregator address or the canonical
    /// [`MULTICALL_ADDRESS`](constants::MULTICALL_ADDRESS).
    pub fn new(provider: impl Into<Arc<Provider<P>>>, address: Option<Address>) -> Self {
        Self {
            provider: provider.into(),
            address: address.unwrap_or(MULTICALL_ADDRESS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            block: None,
            calls: Mutex::new(Vec::new()),
            executed: AtomicBool::new(false),
        }
    }

    /// Sets the number of calls per `eth_call`, clamped to
    /// [`MAX_CHUNK_SIZE`](constants::MAX_CHUNK_SIZE).
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Pins the aggregate calls to a specific block.
    #[must_use]
    pub fn block(mut self, block: impl Into<BlockNumber>) -> Self {
        self.block = Some(block.into());
        self
    }

    /// Records one call and returns its handle. `decode` turns the raw
    /// return bytes into the caller's type once the batch executes.
    pub fn add_call<T, F>(
        &self,
        target: Address,
        calldata: impl Into<Bytes>,
        decode: F,
    ) -> Result<BatchHandle<T>, MulticallError>
    where
        T: Send + 'static,
        F: FnOnce(&[u8]) -> Result<T, ethabi::Error> + Send + 'static,
    {
        if self.executed.load(Ordering::SeqCst) {
            return Err(MulticallError::AlreadyExecuted)
        }

        let (tx, rx) = oneshot::channel();
        let complete: CompleteFn = Box::new(move |outcome| {
            let res = match outcome {
                CallOutcome::Success(data) => decode(&data).map_err(Into::into),
                CallOutcome::Failure(err) => Err(err),
            };
            // handle may have been dropped, which discards the result
            let _ = tx.send(res);
        });

        self.calls.lock().unwrap().push(PendingCall {
            target,
            calldata: calldata.into(),
            complete,
        });
        Ok(BatchHandle { rx })
    }

    /// Records a call described by an [`ethabi::Function`], encoding its
    /// arguments and decoding its outputs. Non-view functions are rejected
    /// here, at recording time: batched calls run under `eth_call` and
    /// could never mutate state anyway.
    pub fn add_function_call(
        &self,
        target: Address,
        function: &Function,
        args: &[Token],
    ) -> Result<BatchHandle<Vec<Token>>, MulticallError> {
        match function.state_mutability {
            StateMutability::View | StateMutability::Pure => {}
            _ => return Err(MulticallError::NonViewFunction(function.name.clone())),
        }

        let calldata = function.encode_input(args)?;
        let function = function.clone();
        self.add_call(target, calldata, move |data| function.decode_output(data))
    }

    /// Number of calls recorded so far.
    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Whether no calls have been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatches the recorded calls in `⌈n / chunk_size⌉` `eth_call`
    /// invocations and completes every handle.
    ///
    /// The recorded list is snapshotted under the lock and the batch is
    /// marked executed before any network traffic; a second `execute` and
    /// any later `add_call` fail with [`MulticallError::AlreadyExecuted`].
    pub async fn execute(&self) -> Result<(), MulticallError> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(MulticallError::AlreadyExecuted)
        }

        let calls = std::mem::take(&mut *self.calls.lock().unwrap());

        let mut iter = calls.into_iter().peekable();
        while iter.peek().is_some() {
            let chunk: Vec<PendingCall> = iter.by_ref().take(self.chunk_size).collect();
            self.execute_chunk(chunk).await;
        }
        Ok(())
    }

    async fn execute_chunk(&self, chunk: Vec<PendingCall>) {
        let tx = TransactionRequest::new()
            .to(self.address)
            .data(encode_aggregate3(&chunk));

        let returned = match self.provider.call(&tx, self.block).await {
            Ok(returned) => returned,
            Err(err) => {
                let err = Arc::new(err);
                for call in chunk {
                    (call.complete)(CallOutcome::Failure(MulticallError::Provider(err.clone())));
                }
                return
            }
        };

        let results = match decode_aggregate3_results(&returned, chunk.len()) {
            Ok(results) => results,
            Err(err) => {
                let err = Arc::new(err);
                for call in chunk {
                    (call.complete)(CallOutcome::Failure(MulticallError::Abi(err.clone())));
                }
                return
            }
        };

        for (call, (success, data)) in chunk.into_iter().zip(results) {
            let outcome = if success && data.is_empty() {
                // an EOA target also "succeeds" with no data
                CallOutcome::Failure(MulticallError::EmptyReturnData)
            } else if success {
                CallOutcome::Success(data)
            } else {
                CallOutcome::Failure(MulticallError::Revert(RevertError::from_raw(data.into())))
            };
            (call.complete)(outcome);
        }
    }
}

/// Builds the calldata of `aggregate3(Call3[])`. Every call allows failure
/// at the contract level, so per-call outcomes come back as `Result` entries
/// instead of reverting the whole aggregate.
fn encode_aggregate3(calls: &[PendingCall]) -> Vec<u8> {
    let tokens: Vec<Token> = calls
        .iter()
        .map(|call| {
            Token::Tuple(vec![
                Token::Address(call.target),
                Token::Bool(true),
                Token::Bytes(call.calldata.to_vec()),
            ])
        })
        .collect();

    let mut data = AGGREGATE3_SELECTOR.to_vec();
    data.extend(ethabi::encode(&[Token::Array(tokens)]));
    data
}

/// Decodes `Result(bool,bytes)[]`, checking the element count against the
/// number of dispatched calls.
fn decode_aggregate3_results(
    data: &[u8],
    expected: usize,
) -> Result<Vec<(bool, Vec<u8>)>, ethabi::Error> {
    let tokens = ethabi::decode(
        &[ParamType::Array(Box::new(ParamType::Tuple(vec![ParamType::Bool, ParamType::Bytes])))],
        data,
    )?;

    let entries = match tokens.into_iter().next() {
        Some(Token::Array(entries)) => entries,
        _ => return Err(ethabi::Error::InvalidData),
    };
    if entries.len() != expected {
        return Err(ethabi::Error::InvalidData)
    }

    entries
        .into_iter()
        .map(|entry| match entry {
            Token::Tuple(mut fields) if fields.len() == 2 => {
                let data = match fields.pop() {
                    Some(Token::Bytes(data)) => data,
                    _ => return Err(ethabi::Error::InvalidData),
                };
                let success = match fields.pop() {
                    Some(Token::Bool(success)) => success,
                    _ => return Err(ethabi::Error::InvalidData),
                };
                Ok((success, data))
            }
            _ => Err(ethabi::Error::InvalidData),
        })
        .collect()
}
