//! Upstream link tests against a local WebSocket server.

use async_trait::async_trait;
use common::{
    CloseReason, FrameHandler, LinkCommand, LinkConfig, LinkState, LinkStateHandle, UpstreamFrame,
    UpstreamLink,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug)]
enum HandlerEvent {
    Frame(UpstreamFrame),
    Disconnect,
    Close(CloseReason),
}

struct RecordingHandler {
    events: mpsc::UnboundedSender<HandlerEvent>,
}

#[async_trait]
impl FrameHandler for RecordingHandler {
    fn authenticate_frame(&self) -> UpstreamFrame {
        UpstreamFrame::named("authenticate", json!({"ssid": "test-ssid", "protocol": 3}))
    }

    fn on_ready(&self) -> Vec<UpstreamFrame> {
        vec![
            UpstreamFrame::bare("balances.get-balances"),
            UpstreamFrame::named("subscribe-positions", json!({"frequency": "frequent"})),
        ]
    }

    async fn on_frame(&self, frame: UpstreamFrame) {
        let _ = self.events.send(HandlerEvent::Frame(frame));
    }

    async fn on_disconnect(&self) {
        let _ = self.events.send(HandlerEvent::Disconnect);
    }

    async fn on_close(&self, reason: CloseReason) {
        let _ = self.events.send(HandlerEvent::Close(reason));
    }
}

struct TestLink {
    state: Arc<LinkStateHandle>,
    command_tx: mpsc::Sender<LinkCommand>,
    events: mpsc::UnboundedReceiver<HandlerEvent>,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_link(url: String, max_reconnects: u32) -> TestLink {
    let (event_tx, events) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(8);
    let state = Arc::new(LinkStateHandle::new());

    let config = LinkConfig {
        url,
        ping_interval: Duration::from_secs(20),
        reconnect_delay: Duration::from_millis(50),
        max_reconnects,
        session_label: "test".to_string(),
    };

    let link = UpstreamLink::new(
        RecordingHandler { events: event_tx },
        config,
        state.clone(),
        command_rx,
    );
    let task = tokio::spawn(link.run());

    TestLink {
        state,
        command_tx,
        events,
        task,
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn read_frame(ws: &mut WebSocketStream<TcpStream>) -> UpstreamFrame {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return UpstreamFrame::parse(text.as_str()).unwrap(),
            Message::Close(_) => panic!("peer closed while waiting for a frame"),
            _ => continue,
        }
    }
}

async fn send_frame(ws: &mut WebSocketStream<TcpStream>, frame: UpstreamFrame) {
    ws.send(Message::Text(frame.to_text().unwrap().into()))
        .await
        .unwrap();
}

async fn next_event(link: &mut TestLink) -> HandlerEvent {
    tokio::time::timeout(Duration::from_secs(5), link.events.recv())
        .await
        .expect("timed out waiting for handler event")
        .expect("handler channel closed")
}

#[tokio::test]
async fn authenticates_then_writes_startup_burst() {
    let (listener, url) = bind().await;
    let mut link = spawn_link(url, 0);

    let mut ws = accept_ws(&listener).await;

    let auth = read_frame(&mut ws).await;
    assert_eq!(auth.name, "authenticate");
    assert_eq!(auth.msg.unwrap()["ssid"], "test-ssid");

    send_frame(&mut ws, UpstreamFrame::bare("authenticated")).await;

    // Acknowledgment is dispatched before the burst hits the wire.
    match next_event(&mut link).await {
        HandlerEvent::Frame(frame) => assert_eq!(frame.name, "authenticated"),
        other => panic!("expected authenticated frame, got {:?}", other),
    }

    let burst_a = read_frame(&mut ws).await;
    let burst_b = read_frame(&mut ws).await;
    assert_eq!(burst_a.name, "balances.get-balances");
    assert_eq!(burst_b.name, "subscribe-positions");

    assert_eq!(link.state.get(), LinkState::Ready);

    link.command_tx.send(LinkCommand::Shutdown).await.unwrap();
    match next_event(&mut link).await {
        HandlerEvent::Close(CloseReason::Shutdown) => {}
        other => panic!("expected shutdown close, got {:?}", other),
    }
    link.task.await.unwrap();
}

#[tokio::test]
async fn replies_pong_to_upstream_ping_and_drops_time_sync() {
    let (listener, url) = bind().await;
    let mut link = spawn_link(url, 0);

    let mut ws = accept_ws(&listener).await;
    let _auth = read_frame(&mut ws).await;
    send_frame(&mut ws, UpstreamFrame::bare("authenticated")).await;
    let _ = next_event(&mut link).await;
    let _burst_a = read_frame(&mut ws).await;
    let _burst_b = read_frame(&mut ws).await;

    send_frame(&mut ws, UpstreamFrame::named("timeSync", json!(1700000000000u64))).await;
    send_frame(&mut ws, UpstreamFrame::bare("ping")).await;

    // timeSync is swallowed; the next wire activity is our pong.
    let pong = read_frame(&mut ws).await;
    assert_eq!(pong.name, "pong");

    // And the handler saw neither keep-alive frame.
    send_frame(&mut ws, UpstreamFrame::named("subscription", json!({"ok": true}))).await;
    match next_event(&mut link).await {
        HandlerEvent::Frame(frame) => assert_eq!(frame.name, "subscription"),
        other => panic!("expected subscription frame, got {:?}", other),
    }

    link.command_tx.send(LinkCommand::Shutdown).await.unwrap();
    link.task.await.unwrap();
}

#[tokio::test]
async fn unauthorized_is_terminal_without_reconnect() {
    let (listener, url) = bind().await;
    let mut link = spawn_link(url, 6);

    let mut ws = accept_ws(&listener).await;
    let _auth = read_frame(&mut ws).await;
    send_frame(&mut ws, UpstreamFrame::bare("unauthorized")).await;

    match next_event(&mut link).await {
        HandlerEvent::Frame(frame) => assert_eq!(frame.name, "unauthorized"),
        other => panic!("expected unauthorized frame, got {:?}", other),
    }
    match next_event(&mut link).await {
        HandlerEvent::Close(CloseReason::AuthRejected) => {}
        other => panic!("expected auth-rejected close, got {:?}", other),
    }

    link.task.await.unwrap();
    assert_eq!(link.state.get(), LinkState::Closed);
}

#[tokio::test]
async fn reconnects_are_bounded_then_terminal() {
    let (listener, url) = bind().await;
    let mut link = spawn_link(url, 2);

    // Drop every connection right after the handshake.
    let server = tokio::spawn(async move {
        for _ in 0..3 {
            let ws = accept_ws(&listener).await;
            drop(ws);
        }
    });

    let mut disconnects = 0;
    loop {
        match next_event(&mut link).await {
            HandlerEvent::Disconnect => disconnects += 1,
            HandlerEvent::Close(CloseReason::ReconnectsExhausted) => break,
            other => panic!("unexpected event {:?}", other),
        }
    }

    // Initial attempt plus two reconnects, each reported once.
    assert_eq!(disconnects, 3);
    assert_eq!(link.state.get(), LinkState::Closed);

    link.task.await.unwrap();
    server.await.unwrap();
}
