//! Connection lifecycle tests: reconnect budget, cancellation, and
//! silent-failure detection against scripted loopback servers.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use tether::{ConnectionStatus, ControlRequest, Engine, EngineConfig, EngineEvent};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(url: &str) -> EngineConfig {
    EngineConfig {
        url: url.to_string(),
        reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(50),
        heartbeat_interval: Duration::from_secs(10),
        heartbeat_grace: Duration::from_secs(30),
        timeout: Duration::from_millis(500),
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let url = format!("ws://{}/chat", listener.local_addr().expect("local addr"));
    (listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.expect("accept");
    tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket handshake")
}

fn fragment_frame(text: &str) -> Message {
    Message::Text(
        json!({
            "type": "stream_fragment",
            "data": {"text": text},
            "metadata": {"timestamp": 1}
        })
        .to_string(),
    )
}

async fn recv_event<T>(
    events: &mut broadcast::Receiver<EngineEvent>,
    mut matcher: impl FnMut(EngineEvent) -> Option<T>,
) -> T {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event wait timed out")
            .expect("event bus closed");
        if let Some(value) = matcher(event) {
            return value;
        }
    }
}

#[tokio::test]
async fn test_reconnect_budget_is_exact() {
    init_logging();
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        // Refuse all reconnects: the listener dies with this scope.
        drop(listener);
        ws.close(None).await.expect("server close");
    });

    let mut engine = Engine::new(config(&url)).expect("valid config");
    let mut events = engine.subscribe();
    engine.connect().await.expect("connect");
    server.await.expect("server task");

    let mut attempts: Vec<u32> = Vec::new();
    let error_message = recv_event(&mut events, |event| match event {
        EngineEvent::Reconnecting {
            attempt,
            max_attempts,
        } => {
            assert_eq!(max_attempts, 3);
            attempts.push(attempt);
            None
        }
        EngineEvent::ConnectionError { message } => Some(message),
        _ => None,
    })
    .await;

    // Exactly three reconnecting events fire before the terminal error.
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(error_message.contains("exhausted"));
    assert_eq!(engine.snapshot().await.status, ConnectionStatus::Error);

    // No further automatic attempts after the budget.
    tokio::time::sleep(Duration::from_millis(300)).await;
    loop {
        match events.try_recv() {
            Ok(EngineEvent::Reconnecting { .. }) => panic!("attempted past the budget"),
            Ok(_) => continue,
            Err(broadcast::error::TryRecvError::Empty) => break,
            Err(e) => panic!("event bus failed: {e}"),
        }
    }
}

#[tokio::test]
async fn test_disconnect_mid_stream_discards_turn() {
    init_logging();
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        for label in ["turn one", "turn two"] {
            let ws = accept(&listener).await;
            let (mut tx, mut rx) = ws.split();
            tx.send(fragment_frame(label)).await.expect("send fragment");
            // Hold until the client goes away.
            while let Ok(Some(_)) = tokio::time::timeout(Duration::from_secs(5), rx.next()).await {}
        }
    });

    let mut engine = Engine::new(config(&url)).expect("valid config");
    let mut events = engine.subscribe();

    engine.connect().await.expect("connect");
    let first_id = recv_event(&mut events, |event| match event {
        EngineEvent::PartialMessage { stream_id, .. } => Some(stream_id),
        _ => None,
    })
    .await;

    engine.disconnect().await;
    recv_event(&mut events, |event| {
        matches!(event, EngineEvent::Disconnected).then_some(())
    })
    .await;
    assert_eq!(
        engine.snapshot().await.status,
        ConnectionStatus::Disconnected
    );

    // Fresh connect, fresh fragments: a distinct stream id.
    engine.connect().await.expect("reconnect");
    let second_id = recv_event(&mut events, |event| match event {
        EngineEvent::PartialMessage { stream_id, .. } => Some(stream_id),
        _ => None,
    })
    .await;
    assert_ne!(first_id, second_id);

    engine.disconnect().await;
    server.await.expect("server task");
}

#[tokio::test]
async fn test_abort_discards_turn_without_synthetic_completion() {
    init_logging();
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let ws = accept(&listener).await;
        let (mut tx, mut rx) = ws.split();

        tx.send(fragment_frame("half a tho")).await.expect("send");

        // Wait for the abort control, then start a new turn.
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.next())
                .await
                .expect("server recv timed out")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(&text).expect("valid JSON");
                if value["type"] == "control" && value["data"]["request"] == "abort" {
                    break;
                }
            }
        }
        tx.send(fragment_frame("fresh start")).await.expect("send");

        let _ = tokio::time::timeout(Duration::from_secs(5), rx.next()).await;
    });

    let mut engine = Engine::new(config(&url)).expect("valid config");
    let mut events = engine.subscribe();
    engine.connect().await.expect("connect");

    let aborted_id = recv_event(&mut events, |event| match event {
        EngineEvent::PartialMessage { stream_id, .. } => Some(stream_id),
        _ => None,
    })
    .await;

    engine
        .send_control(ControlRequest::Abort)
        .await
        .expect("abort");

    // No MessageComplete for the aborted turn; the next fragment is a new one.
    let (next_id, text) = recv_event(&mut events, |event| match event {
        EngineEvent::PartialMessage { stream_id, text } => Some((stream_id, text)),
        EngineEvent::MessageComplete { .. } => {
            panic!("aborted turn must not synthesize a completion")
        }
        _ => None,
    })
    .await;

    assert_eq!(text, "fresh start");
    assert_ne!(aborted_id, next_id);

    engine.disconnect().await;
    server.await.expect("server task");
}

#[tokio::test]
async fn test_silent_failure_takes_reconnect_path() {
    init_logging();
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        // First connection: accept, say nothing, answer nothing. The engine
        // must detect the dead air via the grace window.
        let silent = accept(&listener).await;

        // Second connection: healthy again.
        let ws = accept(&listener).await;
        drop(silent);
        let (mut tx, mut rx) = ws.split();
        tx.send(fragment_frame("revived")).await.expect("send");
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_secs(5), rx.next()).await {}
    });

    let mut cfg = config(&url);
    cfg.heartbeat_interval = Duration::from_millis(100);
    cfg.heartbeat_grace = Duration::from_millis(400);
    let mut engine = Engine::new(cfg).expect("valid config");
    let mut events = engine.subscribe();
    engine.connect().await.expect("connect");

    recv_event(&mut events, |event| {
        matches!(event, EngineEvent::Reconnecting { attempt: 1, .. }).then_some(())
    })
    .await;

    let text = recv_event(&mut events, |event| match event {
        EngineEvent::PartialMessage { text, .. } => Some(text),
        _ => None,
    })
    .await;
    assert_eq!(text, "revived");
    assert_eq!(engine.snapshot().await.reconnect_count, 1);

    engine.disconnect().await;
    server.await.expect("server task");
}
