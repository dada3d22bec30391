#![cfg(feature = "ws")]

//! Integration tests driving the WebSocket transport against an in-process
//! server.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use ethlink_core::types::U256;
use ethlink_providers::{
    JsonRpcClient, Metrics, PubsubClient, WaitStrategy, WsClient, WsClientError, WsConfig,
};
use futures_util::{future::join_all, SinkExt, StreamExt};
use serde_json::{value::to_raw_value, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

type ServerStream = WebSocketStream<TcpStream>;

/// Binds an ephemeral port and serves a single connection with `handler`.
async fn serve<F, Fut>(handler: F) -> String
where
    F: FnOnce(ServerStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        handler(ws).await;
    });
    format!("ws://{addr}")
}

/// Reads frames until a text frame arrives, parsed as JSON.
async fn next_request(ws: &mut ServerStream) -> Value {
    loop {
        match ws.next().await.expect("connection ended").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

fn response(id: u64, result: &str) -> Message {
    Message::Text(format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{result}}}"#))
}

fn notification(subscription: &str, result: &str) -> Message {
    Message::Text(format!(
        r#"{{"jsonrpc":"2.0","method":"eth_subscription","params":{{"subscription":"{subscription}","result":{result}}}}}"#
    ))
}

fn empty_params() -> Box<serde_json::value::RawValue> {
    to_raw_value::<[u8; 0]>(&[]).unwrap()
}

#[derive(Debug, Default)]
struct RecordingMetrics {
    completed: Mutex<Vec<String>>,
    connection_lost: AtomicUsize,
    reconnects: AtomicUsize,
    orphaned: AtomicUsize,
    timeouts: AtomicUsize,
    backpressure: AtomicUsize,
}

impl Metrics for RecordingMetrics {
    fn on_request_completed(&self, method: &str, _latency: Duration) {
        self.completed.lock().unwrap().push(method.to_string());
    }

    fn on_request_timeout(&self, _method: &str, _id: u64) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_backpressure(&self, _pending: usize, _max: usize) {
        self.backpressure.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection_lost(&self) {
        self.connection_lost.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_orphaned_response(&self, _reason: &str) {
        self.orphaned.fetch_add(1, Ordering::SeqCst);
    }
}

fn config_with(metrics: Arc<RecordingMetrics>) -> WsConfig {
    WsConfig { metrics, ..Default::default() }
}

#[tokio::test]
async fn simple_call_resolves_and_reports_metrics() {
    let url = serve(|mut ws| async move {
        let req = next_request(&mut ws).await;
        assert_eq!(req["method"], "eth_chainId");
        let id = req["id"].as_u64().unwrap();
        ws.send(response(id, r#""0x1""#)).await.unwrap();
    })
    .await;

    let metrics = Arc::new(RecordingMetrics::default());
    let client = WsClient::connect_with_config(url, config_with(metrics.clone())).await.unwrap();

    let chain_id: String = client.request("eth_chainId", ()).await.unwrap();
    assert_eq!(chain_id, "0x1");
    assert_eq!(metrics.completed.lock().unwrap().clone(), vec!["eth_chainId".to_string()]);
}

#[tokio::test]
async fn request_ids_are_monotonic_from_one() {
    let url = serve(|mut ws| async move {
        for _ in 0..3 {
            let req = next_request(&mut ws).await;
            let id = req["id"].as_u64().unwrap();
            ws.send(response(id, &id.to_string())).await.unwrap();
        }
    })
    .await;

    let client = WsClient::connect(url).await.unwrap();
    for expected in 1u64..=3 {
        let echoed: u64 = client.request("eth_blockNumber", ()).await.unwrap();
        assert_eq!(echoed, expected);
    }
}

#[tokio::test]
async fn orphaned_responses_are_dropped_and_counted() {
    let url = serve(|mut ws| async move {
        let req = next_request(&mut ws).await;
        let id = req["id"].as_u64().unwrap();
        // a response nobody asked for, then the real one
        ws.send(response(id + 1000, "1")).await.unwrap();
        ws.send(response(id, "2")).await.unwrap();
    })
    .await;

    let metrics = Arc::new(RecordingMetrics::default());
    let client = WsClient::connect_with_config(url, config_with(metrics.clone())).await.unwrap();

    let res: u64 = client.request("eth_blockNumber", ()).await.unwrap();
    assert_eq!(res, 2);
    assert_eq!(metrics.orphaned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscription_notifications_arrive_in_order() {
    let url = serve(|mut ws| async move {
        let req = next_request(&mut ws).await;
        assert_eq!(req["method"], "eth_subscribe");
        let id = req["id"].as_u64().unwrap();
        ws.send(response(id, r#""0xabc""#)).await.unwrap();

        for n in 1..=3 {
            ws.send(notification("0xabc", &n.to_string())).await.unwrap();
        }

        // the unsubscribe must name the server-side id
        let unsub = next_request(&mut ws).await;
        assert_eq!(unsub["method"], "eth_unsubscribe");
        let ack = unsub["params"][0] == "0xabc";
        let id = unsub["id"].as_u64().unwrap();
        ws.send(response(id, &ack.to_string())).await.unwrap();
    })
    .await;

    let client = WsClient::connect(url).await.unwrap();

    let sub_id: U256 = client.request("eth_subscribe", ["newHeads"]).await.unwrap();
    let mut stream = PubsubClient::subscribe(&client, sub_id).unwrap();

    for expected in 1u64..=3 {
        let raw = stream.next().await.unwrap();
        let got: u64 = serde_json::from_str(raw.get()).unwrap();
        assert_eq!(got, expected);
    }

    // local removal is unconditional; the returned value is the server ack
    assert!(client.unsubscribe_with_ack(sub_id).await.unwrap());
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn disconnect_fails_pending_without_replay() {
    let metrics = Arc::new(RecordingMetrics::default());

    let url = serve(|mut ws| async move {
        // swallow five requests, then die without answering any
        for _ in 0..5 {
            next_request(&mut ws).await;
        }
        // dropping the stream closes the TCP connection
    })
    .await;

    let config = WsConfig {
        metrics: metrics.clone(),
        reconnect_base: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        max_reconnects: 2,
        ..Default::default()
    };
    let client = WsClient::connect_with_config(url, config).await.unwrap();

    let pending =
        (0..5).map(|_| client.request::<_, u64>("eth_blockNumber", ())).collect::<Vec<_>>();
    let results = join_all(pending).await;

    for res in results {
        assert!(
            matches!(res, Err(WsClientError::ConnectionLost)),
            "pending requests fail with ConnectionLost, got {res:?}"
        );
    }
    assert_eq!(metrics.connection_lost.load(Ordering::SeqCst), 1);

    // reconnects were attempted against a dead listener; once the budget is
    // spent the transport is gone
    tokio::time::sleep(Duration::from_millis(200)).await;
    let err = client.request::<_, u64>("eth_blockNumber", ()).await.unwrap_err();
    assert!(matches!(err, WsClientError::UnexpectedClose | WsClientError::Cancelled));
}

#[tokio::test]
async fn reconnect_reissues_subscriptions_with_stable_ids() {
    let metrics = Arc::new(RecordingMetrics::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // first connection: subscribe, one notification, then die
        {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let req = next_request(&mut ws).await;
            assert_eq!(req["method"], "eth_subscribe");
            let id = req["id"].as_u64().unwrap();
            ws.send(response(id, r#""0xaaa""#)).await.unwrap();
            ws.send(notification("0xaaa", "1")).await.unwrap();
        }

        // second connection: the transport re-subscribes on its own, with a
        // fresh server id
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let req = next_request(&mut ws).await;
        assert_eq!(req["method"], "eth_subscribe");
        let id = req["id"].as_u64().unwrap();
        ws.send(response(id, r#""0xbbb""#)).await.unwrap();
        ws.send(notification("0xbbb", "2")).await.unwrap();
        // hold the connection open
        while ws.next().await.is_some() {}
    });

    let config = WsConfig {
        metrics: metrics.clone(),
        reconnect_base: Duration::from_millis(10),
        ..Default::default()
    };
    let client =
        WsClient::connect_with_config(format!("ws://{addr}"), config).await.unwrap();

    let sub_id: U256 = client.request("eth_subscribe", ["newHeads"]).await.unwrap();
    let mut stream = PubsubClient::subscribe(&client, sub_id).unwrap();

    let first: u64 = serde_json::from_str(stream.next().await.unwrap().get()).unwrap();
    assert_eq!(first, 1);

    // the outage is invisible to the stream: same id keeps delivering
    let second: u64 = serde_json::from_str(stream.next().await.unwrap().get()).unwrap();
    assert_eq!(second, 2);

    assert_eq!(metrics.connection_lost.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.reconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sweeper_times_out_unanswered_requests() {
    let url = serve(|mut ws| async move {
        // read and ignore everything, keeping the connection alive
        while ws.next().await.is_some() {}
    })
    .await;

    let metrics = Arc::new(RecordingMetrics::default());
    let config = WsConfig {
        metrics: metrics.clone(),
        request_timeout: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let client = WsClient::connect_with_config(url, config).await.unwrap();

    let res = tokio::time::timeout(
        Duration::from_secs(2),
        client.request::<_, u64>("eth_blockNumber", ()),
    )
    .await
    .expect("the sweeper must fire well before two seconds");

    assert!(matches!(res, Err(WsClientError::RequestTimeout)));
    assert_eq!(metrics.timeouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_results_come_back_in_input_order() {
    let url = serve(|mut ws| async move {
        let frame = next_request(&mut ws).await;
        let reqs = frame.as_array().expect("batch frames are arrays").clone();
        assert_eq!(reqs.len(), 3);

        // answer in reverse order; correlation is by id, not arrival
        let responses: Vec<String> = reqs
            .iter()
            .rev()
            .map(|req| {
                let id = req["id"].as_u64().unwrap();
                format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{id}}}"#)
            })
            .collect();
        ws.send(Message::Text(format!("[{}]", responses.join(",")))).await.unwrap();
    })
    .await;

    let client = WsClient::connect(url).await.unwrap();

    let calls = (0..3).map(|_| ("eth_blockNumber".to_string(), empty_params())).collect();
    let results = client.request_batch(calls).await.unwrap();

    let ids: Vec<u64> = results
        .into_iter()
        .map(|res| serde_json::from_str(res.unwrap().get()).unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn full_pending_table_applies_backpressure() {
    let url = serve(|mut ws| async move {
        while ws.next().await.is_some() {}
    })
    .await;

    let metrics = Arc::new(RecordingMetrics::default());
    let config = WsConfig {
        metrics: metrics.clone(),
        max_pending: 2,
        wait_strategy: WaitStrategy::Yielding,
        ..Default::default()
    };
    let client = WsClient::connect_with_config(url, config).await.unwrap();

    for _ in 0..2 {
        let inflight = client.clone();
        tokio::spawn(async move {
            let _ = inflight.request::<_, u64>("eth_blockNumber", ()).await;
        });
    }
    // let both land in the pending table
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client.request::<_, u64>("eth_blockNumber", ()).await.unwrap_err();
    assert!(
        matches!(err, WsClientError::Backpressure { pending: 2, max: 2 }),
        "expected backpressure, got {err:?}"
    );
    assert_eq!(metrics.backpressure.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn graceful_close_drains_inflight_work() {
    let url = serve(|mut ws| async move {
        let req = next_request(&mut ws).await;
        let id = req["id"].as_u64().unwrap();
        // answer late, inside the close grace period
        tokio::time::sleep(Duration::from_millis(200)).await;
        ws.send(response(id, "7")).await.unwrap();
        while ws.next().await.is_some() {}
    })
    .await;

    let client = WsClient::connect(url).await.unwrap();

    let inflight = client.clone();
    let pending =
        tokio::spawn(async move { inflight.request::<_, u64>("eth_blockNumber", ()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close().await.unwrap();

    // the in-flight request still resolved during the drain window
    assert_eq!(pending.await.unwrap().unwrap(), 7);

    // but the transport accepts nothing new
    let err = client.request::<_, u64>("eth_blockNumber", ()).await.unwrap_err();
    assert!(matches!(err, WsClientError::UnexpectedClose | WsClientError::Cancelled));
}
