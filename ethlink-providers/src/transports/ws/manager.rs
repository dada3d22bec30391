use super::{
    backend::{BackendDriver, WsBackend},
    ActiveSub, ConnectionDetails, InFlight, Instruction, Notification, PubSubItem, RequestError,
    Response, SubId, WsClient, WsClientError, WsConfig,
};
use crate::{transports::common::serialize_batch, Metrics};
use ethlink_core::types::U256;
use futures_channel::{mpsc, oneshot};
use futures_util::{select_biased, FutureExt, StreamExt};
use serde_json::value::{to_raw_value, RawValue};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

pub(super) type SharedChannelMap =
    Arc<Mutex<HashMap<U256, mpsc::UnboundedReceiver<Box<RawValue>>>>>;

/// How long a graceful close waits for in-flight responses before failing
/// the remainder.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// This struct manages the relationship between the u64 request ID, and U256
/// server-side subscription ID. It does this by aliasing the server ID to the
/// request ID, and returning the Request ID to the caller (hiding the server
/// ID in the SubscriptionManager internals.) Giving the caller a "fake"
/// subscription id allows the subscription to behave consistently across
/// reconnections.
pub(super) struct SubscriptionManager {
    // Active subs indexed by request id
    subs: BTreeMap<u64, ActiveSub>,
    // Maps active server-side IDs to local subscription IDs
    aliases: HashMap<U256, u64>,
    // Used to share notification channels with the WsClient(s)
    channel_map: SharedChannelMap,
}

impl SubscriptionManager {
    fn new(channel_map: SharedChannelMap) -> Self {
        Self { subs: Default::default(), aliases: Default::default(), channel_map }
    }

    fn count(&self) -> usize {
        self.subs.len()
    }

    fn add_alias(&mut self, sub: U256, id: u64) {
        if let Some(entry) = self.subs.get_mut(&id) {
            entry.current_server_id = Some(sub);
        }
        self.aliases.insert(sub, id);
    }

    /// Drops the local state for subscription `id` and returns the server id
    /// it was aliased to, if the subscription was live.
    fn remove_sub(&mut self, id: u64) -> Option<U256> {
        let sub = self.subs.remove(&id)?;
        self.channel_map.lock().unwrap().remove(&id.into());
        if let Some(server_id) = sub.current_server_id {
            self.aliases.remove(&server_id);
            Some(server_id)
        } else {
            None
        }
    }

    #[tracing::instrument(skip_all, fields(server_id = ?notification.subscription))]
    fn handle_notification(&mut self, notification: Notification, metrics: &Arc<dyn Metrics>) {
        let server_id = notification.subscription;

        // If no alias, just drop it
        let Some(id) = self.aliases.get(&server_id).copied() else {
            tracing::debug!(
                server_id = format!("0x{server_id:x}"),
                "No aliased subscription found"
            );
            metrics.on_orphaned_response("no subscription for server id");
            return
        };

        let Some(active) = self.subs.get(&id) else {
            tracing::trace!(id, "Aliased subscription found, but not active");
            self.aliases.remove(&server_id);
            return
        };

        tracing::debug!(id, "Forwarding notification to listener");
        metrics.on_subscription_notification(id);
        // send the notification over the channel
        let send_res = active.channel.unbounded_send(notification.result);

        // receiver has dropped, so we drop the sub. A dead listener must not
        // disturb the others
        if send_res.is_err() {
            tracing::debug!(id, "Listener dropped. Dropping alias and subs");
            metrics.on_subscription_callback_error(id, "listener dropped");
            self.aliases.remove(&server_id);
            self.subs.remove(&id);
        }
    }

    /// Allows the result of an `eth_subscribe` request to be rewritten to
    /// the stable, client-facing subscription id.
    fn req_success(&mut self, id: u64, result: Box<RawValue>) -> Box<RawValue> {
        if let Ok(server_id) = serde_json::from_str::<SubId>(result.get()) {
            tracing::debug!(id, server_id = %server_id.0, "Registering new sub alias");
            self.add_alias(server_id.0, id);
            let result = U256::from(id);
            to_raw_value(&format!("0x{result:x}")).expect("valid json")
        } else {
            result
        }
    }

    fn has(&self, id: u64) -> bool {
        self.subs.contains_key(&id)
    }

    fn to_reissue(&self) -> impl Iterator<Item = (&u64, &ActiveSub)> {
        self.subs.iter()
    }

    fn service_subscription_request(
        &mut self,
        id: u64,
        params: Box<RawValue>,
    ) -> Result<(), WsClientError> {
        let (tx, rx) = mpsc::unbounded();

        let active_sub = ActiveSub { params, channel: tx, current_server_id: None };

        // This insertion should be made BEFORE the request is dispatched, so
        // that the notification channel exists by the time the server acks
        {
            self.channel_map.lock().unwrap().insert(id.into(), rx);
        }
        self.subs.insert(id, active_sub);

        Ok(())
    }
}

/// The `RequestManager` owns the pending-request table and the subscription
/// table. It is the single consumer of user instructions and of frames
/// parsed by the [`WsBackend`], so all dispatch decisions happen on one
/// task.
///
/// Responsibilities, in the order the event loop prioritizes them:
///
/// 1. route inbound frames to pending requests and subscription listeners;
/// 2. recover from socket loss: every in-flight request fails immediately
///    (requests are never replayed), then the connection is re-established
///    with exponential backoff and active subscriptions are re-issued under
///    their existing client-facing ids;
/// 3. accept new work, subject to the pending-table capacity;
/// 4. expire pending requests older than the request timeout, via a
///    periodic sweep rather than per-request timers.
///
/// The `RequestManager` shuts down and drops when all `WsClient` instances
/// have been dropped, or after a user-initiated close drains.
pub(super) struct RequestManager {
    // Next JSON-RPC Request ID
    id: AtomicU64,
    // Transport tuning knobs and metrics sink
    config: WsConfig,
    // Subscription manager
    subs: SubscriptionManager,
    // Requests for which a response has not been received
    reqs: HashMap<u64, InFlight>,
    // Control of the active WS backend
    backend: BackendDriver,
    // The URL and optional auth info for the connection
    conn: ConnectionDetails,
    // Instructions from the user-facing providers
    instructions: mpsc::Receiver<Instruction>,
}

impl RequestManager {
    fn next_id(&mut self) -> u64 {
        self.id.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) async fn connect(
        conn: ConnectionDetails,
        config: WsConfig,
    ) -> Result<(Self, WsClient), WsClientError> {
        config.validate()?;

        let (ws, backend) = WsBackend::connect(conn.clone(), config.metrics.clone()).await?;
        ws.spawn();

        let (instructions_tx, instructions_rx) = mpsc::channel(config.instruction_buffer);
        let channel_map: SharedChannelMap = Default::default();

        let client = WsClient {
            instructions: instructions_tx,
            channel_map: channel_map.clone(),
            wait_strategy: config.wait_strategy,
            queue_capacity: config.instruction_buffer,
            metrics: config.metrics.clone(),
        };

        Ok((
            Self {
                id: AtomicU64::new(1),
                config,
                subs: SubscriptionManager::new(channel_map),
                reqs: Default::default(),
                backend,
                conn,
                instructions: instructions_rx,
            },
            client,
        ))
    }

    /// Called when the backend signals socket loss. In-flight requests fail
    /// right away; the semantics of silently replaying them on a fresh
    /// connection are unknowable, so we never do.
    async fn on_disconnect(&mut self) -> Result<(), WsClientError> {
        self.config.metrics.on_connection_lost();
        tracing::warn!(url = self.conn.url, "Connection lost, failing in-flight requests");
        self.fail_all_pending(|| RequestError::ConnectionLost);
        self.reconnect().await
    }

    async fn reconnect(&mut self) -> Result<(), WsClientError> {
        let mut delay = self.config.reconnect_base;

        for attempt in 1..=self.config.max_reconnects {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.reconnect_max);

            tracing::info!(attempt, url = self.conn.url, "Reconnecting to backend");
            match WsBackend::connect(self.conn.clone(), self.config.metrics.clone()).await {
                Ok((ws, mut backend)) => {
                    ws.spawn();
                    std::mem::swap(&mut self.backend, &mut backend);
                    let mut old_backend = backend;

                    // Drain any frames the old backend parsed before dying;
                    // their pendings are gone, so they surface as orphans
                    tracing::debug!("Draining old backend to_handle channel");
                    while let Some(to_handle) = old_backend.to_handle.next().await {
                        self.handle(to_handle);
                    }

                    // issue a shutdown command (even though it's likely gone)
                    old_backend.shutdown();

                    self.config.metrics.on_reconnect();
                    self.reissue_subscriptions()?;
                    tracing::info!(subs = self.subs.count(), "Re-connection complete");
                    return Ok(())
                }
                Err(err) => {
                    tracing::warn!(attempt, err = %err, "Reconnect attempt failed");
                }
            }
        }

        Err(WsClientError::TooManyReconnects)
    }

    /// Re-issues `eth_subscribe` for every active subscription under its
    /// original request id, so the server's fresh subscription ids alias
    /// back to the ids callers already hold.
    fn reissue_subscriptions(&mut self) -> Result<(), WsClientError> {
        let mut frames = Vec::with_capacity(self.subs.count());
        for (id, sub) in self.subs.to_reissue() {
            // Response routing needs a pending entry; its receiver half is
            // dropped, as the alias rewrite is all we care about
            let (tx, _rx) = oneshot::channel();
            let in_flight = InFlight {
                method: "eth_subscribe".to_string(),
                params: sub.params.clone(),
                started: std::time::Instant::now(),
                channel: tx,
            };
            frames.push((*id, in_flight));
        }

        tracing::debug!(count = frames.len(), "Re-issuing active subscriptions");
        for (id, in_flight) in frames {
            let req = in_flight.serialize_raw(id)?;
            self.backend.dispatcher.unbounded_send(req).map_err(|_| WsClientError::DeadChannel)?;
            self.reqs.insert(id, in_flight);
        }
        Ok(())
    }

    fn fail_all_pending(&mut self, cause: impl Fn() -> RequestError) {
        for (_, req) in self.reqs.drain() {
            // pending fut may have been dropped, this is fine
            let _ = req.channel.send(Err(cause()));
        }
    }

    /// Expires pending entries older than the configured request timeout.
    fn sweep_expired(&mut self) {
        let timeout = self.config.request_timeout;
        let expired: Vec<u64> = self
            .reqs
            .iter()
            .filter(|(_, req)| req.started.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(req) = self.reqs.remove(&id) {
                tracing::debug!(id, method = %req.method, "Expiring timed-out request");
                self.config.metrics.on_request_timeout(&req.method, id);
                let _ = req.channel.send(Err(RequestError::Timeout));
            }
        }
    }

    #[tracing::instrument(skip(self, result))]
    fn req_success(&mut self, id: u64, result: Box<RawValue>) {
        tracing::trace!(%result, "Success response received");
        if let Some(req) = self.reqs.remove(&id) {
            tracing::debug!("Sending result to request listener");
            self.config.metrics.on_request_completed(&req.method, req.started.elapsed());
            // Allow subscription manager to rewrite the result if the request
            // corresponds to a known ID
            let result = if self.subs.has(id) { self.subs.req_success(id, result) } else { result };
            let _ = req.channel.send(Ok(result));
        } else {
            tracing::trace!("No InFlight found");
            self.config.metrics.on_orphaned_response("no pending request");
        }
    }

    fn req_fail(&mut self, id: u64, error: crate::JsonRpcError) {
        if let Some(req) = self.reqs.remove(&id) {
            self.config.metrics.on_request_failed(&req.method, &error.message);
            // pending fut has been dropped, this is fine
            let _ = req.channel.send(Err(RequestError::Rpc(error)));
        } else {
            self.config.metrics.on_orphaned_response("no pending request");
        }
    }

    fn handle(&mut self, item: PubSubItem) {
        match item {
            PubSubItem::Success { id, result } => self.req_success(id, result),
            PubSubItem::Error { id, error } => self.req_fail(id, error),
            PubSubItem::Notification { params } => {
                self.subs.handle_notification(params, &self.config.metrics)
            }
        }
    }

    /// Registers an in-flight request and returns its serialized frame.
    /// Intercepts `eth_subscribe` so the notification channel exists before
    /// the server can ack.
    fn enqueue(&mut self, id: u64, in_flight: InFlight) -> Result<Box<RawValue>, WsClientError> {
        let req = in_flight.serialize_raw(id)?;

        if in_flight.method == "eth_subscribe" {
            self.subs.service_subscription_request(id, in_flight.params.clone())?;
        }

        self.config.metrics.on_request_started(&in_flight.method);
        self.reqs.insert(id, in_flight);
        Ok(req)
    }

    /// Rejects `extra` more pending requests if they would overflow the
    /// table. Backpressure is surfaced to the caller, never a silent
    /// overwrite.
    fn check_capacity(&self, extra: usize) -> Result<(), RequestError> {
        let pending = self.reqs.len();
        if pending + extra > self.config.max_pending {
            self.config.metrics.on_backpressure(pending, self.config.max_pending);
            return Err(RequestError::Backpressure { pending, max: self.config.max_pending })
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, params, sender))]
    fn service_request(
        &mut self,
        id: u64,
        method: String,
        params: Box<RawValue>,
        sender: oneshot::Sender<Response>,
    ) -> Result<(), WsClientError> {
        if let Err(err) = self.check_capacity(1) {
            let _ = sender.send(Err(err));
            return Ok(())
        }

        let in_flight =
            InFlight { method, params, started: std::time::Instant::now(), channel: sender };
        let req = self.enqueue(id, in_flight)?;

        tracing::debug!("Dispatching request to backend");
        self.backend.dispatcher.unbounded_send(req).map_err(|_| WsClientError::DeadChannel)?;
        Ok(())
    }

    /// Packs several requests into one array frame. Correlation stays by id;
    /// each request gets its own pending entry, so individual responses,
    /// timeouts and failures complete their own sender.
    fn service_batch(
        &mut self,
        requests: Vec<(String, Box<RawValue>)>,
        senders: Vec<oneshot::Sender<Response>>,
    ) -> Result<(), WsClientError> {
        if let Err(err) = self.check_capacity(requests.len()) {
            let cause = match err {
                RequestError::Backpressure { pending, max } => move || RequestError::Backpressure {
                    pending,
                    max,
                },
                _ => unreachable!("check_capacity only fails with backpressure"),
            };
            for sender in senders {
                let _ = sender.send(Err(cause()));
            }
            return Ok(())
        }

        let mut frames = Vec::with_capacity(requests.len());
        for ((method, params), sender) in requests.into_iter().zip(senders) {
            let id = self.next_id();
            let in_flight =
                InFlight { method, params, started: std::time::Instant::now(), channel: sender };
            frames.push(self.enqueue(id, in_flight)?);
        }

        let frame = serialize_batch(&frames)?;
        tracing::debug!(len = frames.len(), "Dispatching batch frame to backend");
        self.backend.dispatcher.unbounded_send(frame).map_err(|_| WsClientError::DeadChannel)?;
        Ok(())
    }

    /// Removes the local listener unconditionally and, if the subscription
    /// was live on the server, issues `eth_unsubscribe` whose ack completes
    /// `sender`.
    fn service_unsubscribe(
        &mut self,
        id: U256,
        sender: oneshot::Sender<Response>,
    ) -> Result<(), WsClientError> {
        match self.subs.remove_sub(id.low_u64()) {
            Some(server_id) => {
                tracing::debug!(server_id = format!("0x{server_id:x}"), "Ending subscription");
                let req_id = self.next_id();
                let in_flight = InFlight {
                    method: "eth_unsubscribe".to_string(),
                    params: to_raw_value(&[server_id])?,
                    started: std::time::Instant::now(),
                    channel: sender,
                };
                let req = self.enqueue(req_id, in_flight)?;
                self.backend
                    .dispatcher
                    .unbounded_send(req)
                    .map_err(|_| WsClientError::DeadChannel)?;
            }
            None => {
                // nothing live on the server; ack locally
                let _ = sender.send(Ok(to_raw_value(&false)?));
            }
        }
        Ok(())
    }

    fn service_instruction(&mut self, instruction: Instruction) -> Result<(), WsClientError> {
        match instruction {
            Instruction::Request { method, params, sender } => {
                let id = self.next_id();
                self.service_request(id, method, params, sender)?;
            }
            Instruction::BatchRequest { requests, senders } => {
                self.service_batch(requests, senders)?;
            }
            Instruction::Unsubscribe { id, sender } => {
                self.service_unsubscribe(id, sender)?;
            }
            Instruction::Close => unreachable!("close is handled by the event loop"),
        }
        Ok(())
    }

    /// Stops accepting instructions, waits up to [`SHUTDOWN_GRACE`] for
    /// in-flight responses, then fails the remainder with `Cancelled`.
    async fn graceful_close(&mut self) {
        tracing::debug!(pending = self.reqs.len(), "Graceful close requested");
        self.instructions.close();

        let deadline = tokio::time::sleep(SHUTDOWN_GRACE).fuse();
        tokio::pin!(deadline);

        while !self.reqs.is_empty() {
            select_biased! {
                item_opt = self.backend.to_handle.next() => match item_opt {
                    Some(item) => self.handle(item),
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        self.fail_all_pending(|| RequestError::Cancelled);
    }

    pub(super) fn spawn(mut self) {
        let fut = async move {
            let mut next_sweep = tokio::time::Instant::now() + self.config.sweep_interval;
            let result = loop {
                let sweep = tokio::time::sleep_until(next_sweep).fuse();
                tokio::pin!(sweep);

                // We bias the loop so that we always handle messages before
                // reconnecting, and always reconnect before dispatching new
                // requests
                select_biased! {
                    item_opt = self.backend.to_handle.next() => {
                        match item_opt {
                            Some(item) => self.handle(item),
                            // Backend is gone, so reconnect
                            None => if let Err(e) = self.on_disconnect().await {
                                break Err(e);
                            }
                        }
                    },
                    _ = &mut self.backend.error => {
                        if let Err(e) = self.on_disconnect().await {
                            break Err(e);
                        }
                    },
                    inst_opt = self.instructions.next() => {
                        match inst_opt {
                            Some(Instruction::Close) => {
                                self.graceful_close().await;
                                break Ok(());
                            }
                            Some(instruction) => if let Err(e) = self.service_instruction(instruction) { break Err(e) },
                            // User-facing side is gone, so just exit
                            None => break Ok(()),
                        }
                    },
                    _ = sweep => {
                        self.sweep_expired();
                        next_sweep = tokio::time::Instant::now() + self.config.sweep_interval;
                    },
                }
            };
            if let Err(err) = result {
                tracing::error!(%err, "Exiting manager task with error");
            }
            // Whatever the exit path, nothing will complete these anymore
            self.fail_all_pending(|| RequestError::Cancelled);
            // Issue the shutdown command. we don't care if it is received
            self.backend.shutdown();
        };

        tokio::spawn(fut);
    }
}
