use std::sync::Arc;

use futures_channel::{mpsc, oneshot};
use futures_util::{select, sink::SinkExt, stream::StreamExt, FutureExt};

use serde_json::value::RawValue;

use super::{types::*, WsClientError};
use crate::Metrics;
use tracing::{error, trace};

const KEEPALIVE: std::time::Duration = std::time::Duration::from_secs(10);

/// `BackendDriver` drives a specific `WsBackend`. It can be used to issue
/// requests, receive responses, see errors, and shut down the backend.
pub(super) struct BackendDriver {
    // Pubsub items from the backend, received via WS
    pub to_handle: mpsc::UnboundedReceiver<PubSubItem>,
    // Notification from the backend of a terminal error
    pub error: oneshot::Receiver<()>,

    // Requests that the backend should dispatch
    pub dispatcher: mpsc::UnboundedSender<Box<RawValue>>,
    // Notify the backend of intentional shutdown
    shutdown: oneshot::Sender<()>,
}

impl BackendDriver {
    pub(super) fn shutdown(self) {
        // don't care if it fails, as that means the backend is gone anyway
        let _ = self.shutdown.send(());
    }
}

/// `WsBackend` is the sole owner of the socket: every read and write happens
/// on its task. It forwards parsed frames to the `RequestManager` and writes
/// out frames the manager dispatches, with a simple ping-based keepalive to
/// prevent inactivity from triggering server-side closes.
///
/// The `WsBackend` shuts down when instructed to by the `RequestManager` or
/// when the `RequestManager` drops (because the inbound channel will close).
pub(super) struct WsBackend {
    server: InternalStream,

    // channel to the manager, through which to send items received via WS
    handler: mpsc::UnboundedSender<PubSubItem>,
    // notify manager of an error causing this task to halt
    error: oneshot::Sender<()>,

    // channel of inbound requests to dispatch
    to_dispatch: mpsc::UnboundedReceiver<Box<RawValue>>,
    // notification from manager of intentional shutdown
    shutdown: oneshot::Receiver<()>,

    metrics: Arc<dyn Metrics>,
}

impl WsBackend {
    pub(super) async fn connect(
        details: ConnectionDetails,
        metrics: Arc<dyn Metrics>,
    ) -> Result<(Self, BackendDriver), WsClientError> {
        let ws = connect_async(details).await?.0.fuse();
        Ok(Self::new(ws, metrics))
    }

    pub(super) fn new(server: InternalStream, metrics: Arc<dyn Metrics>) -> (Self, BackendDriver) {
        let (handler, to_handle) = mpsc::unbounded();
        let (dispatcher, to_dispatch) = mpsc::unbounded();
        let (error_tx, error_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        (
            WsBackend {
                server,
                handler,
                error: error_tx,
                to_dispatch,
                shutdown: shutdown_rx,
                metrics,
            },
            BackendDriver { to_handle, error: error_rx, dispatcher, shutdown: shutdown_tx },
        )
    }

    /// Parses a text frame and forwards its items to the manager. A frame is
    /// either a single response/notification object, or an array of them
    /// (the reply to a batch send).
    fn handle_text(&mut self, t: String) -> Result<(), WsClientError> {
        trace!(text = t, "Received message");
        if t.trim_start().starts_with('[') {
            match serde_json::from_str::<Vec<&RawValue>>(&t) {
                Ok(items) => {
                    for raw in items {
                        self.forward_item(raw.get())?;
                    }
                }
                Err(e) => {
                    error!(e = %e, "Failed to split batch frame");
                    self.metrics.on_orphaned_response("unparseable batch frame");
                }
            }
            return Ok(())
        }
        self.forward_item(&t)
    }

    fn forward_item(&mut self, raw: &str) -> Result<(), WsClientError> {
        match serde_json::from_str::<PubSubItem>(raw) {
            Ok(item) => {
                trace!(%item, "Deserialized message");
                if self.handler.unbounded_send(item).is_err() {
                    return Err(WsClientError::DeadChannel)
                }
            }
            Err(e) => {
                // a malformed frame is dropped, not fatal to the connection
                error!(e = %e, "Failed to deserialize message");
                self.metrics.on_orphaned_response("unparseable frame");
            }
        }
        Ok(())
    }

    async fn handle(&mut self, item: WsStreamItem) -> Result<(), WsClientError> {
        match item {
            Ok(item) => match item {
                Message::Text(t) => self.handle_text(t),
                // https://github.com/snapview/tungstenite-rs/blob/42b8797e8b7f39efb7d9322dc8af3e9089db4f7d/src/protocol/mod.rs#L172-L175
                Message::Ping(_) => Ok(()),
                Message::Pong(_) => Ok(()),
                Message::Frame(_) => Ok(()),

                Message::Binary(buf) => Err(WsClientError::UnexpectedBinary(buf)),
                Message::Close(frame) => {
                    if let Some(frame) = frame {
                        error!("Close frame: {frame}");
                    }
                    Err(WsClientError::UnexpectedClose)
                }
            },
            Err(e) => {
                error!(err = %e, "Error response from WS");
                Err(e.into())
            }
        }
    }

    pub(super) fn spawn(mut self) {
        let fut = async move {
            let mut err = false;
            loop {
                let keepalive = tokio::time::sleep(KEEPALIVE).fuse();
                tokio::pin!(keepalive);

                select! {
                    _ = keepalive => {
                        if let Err(e) = self.server.send(Message::Ping(vec![])).await {
                            error!(err = %e, "WS connection error");
                            err = true;
                            break
                        }
                    }
                    resp = self.server.next() => {
                        match resp {
                            Some(item) => {
                                err = self.handle(item).await.is_err();
                                if err { break }
                            },
                            None => {
                                error!("WS server has gone away");
                                err = true;
                                break
                            },
                        }
                    }
                    // we've received a new dispatch, so we send it via
                    // websocket
                    inst = self.to_dispatch.next() => {
                        match inst {
                            Some(msg) => {
                                if let Err(e) = self.server.send(Message::Text(msg.to_string())).await {
                                    error!(err = %e, "WS connection error");
                                    err = true;
                                    break
                                }
                            },
                            // dispatcher has gone away
                            None => {
                                break
                            },
                        }
                    },
                    // break on shutdown recv, or on shutdown recv error
                    _ = &mut self.shutdown => {
                        break
                    },
                }
            }
            if err {
                let _ = self.error.send(());
            }
        };

        tokio::spawn(fut);
    }
}
