//! Upstream WebSocket link: credentialled handshake, keep-alive, frame
//! dispatch, and bounded reconnection.

use crate::error::{Error, Result};
use crate::frame::{events, UpstreamFrame};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Lifecycle of the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Idle = 0,
    Connecting = 1,
    Authenticating = 2,
    Ready = 3,
    Degraded = 4,
    Closed = 5,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LinkState::Connecting,
            2 => LinkState::Authenticating,
            3 => LinkState::Ready,
            4 => LinkState::Degraded,
            5 => LinkState::Closed,
            _ => LinkState::Idle,
        }
    }
}

/// Lock-free view of the link state, shared with the session mediator so it
/// can answer commands without round-tripping the link task.
#[derive(Debug)]
pub struct LinkStateHandle(AtomicU8);

impl LinkStateHandle {
    pub fn new() -> Self {
        Self(AtomicU8::new(LinkState::Idle as u8))
    }

    pub fn get(&self) -> LinkState {
        LinkState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.get() == LinkState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.get() == LinkState::Closed
    }
}

impl Default for LinkStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the link reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Upstream answered `unauthorized`. Terminal, no reconnect.
    AuthRejected,
    /// The reconnect budget is spent.
    ReconnectsExhausted,
    /// The session asked the link to stop.
    Shutdown,
}

/// Commands the session mediator sends to the link task.
#[derive(Debug)]
pub enum LinkCommand {
    /// Write a frame to the upstream socket.
    Send(UpstreamFrame),
    /// Close the socket and stop the task.
    Shutdown,
}

/// Configuration for the upstream link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upstream WebSocket URL.
    pub url: String,
    /// Interval between outgoing `ping` frames while Ready.
    pub ping_interval: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Reconnect attempts before the link goes terminal.
    pub max_reconnects: u32,
    /// Session label for logs.
    pub session_label: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ping_interval: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(4),
            max_reconnects: 6,
            session_label: "unknown".to_string(),
        }
    }
}

/// Session-side hooks the link drives. Keep-alive frames (`ping`, `pong`,
/// `timeSync`) are consumed by the link and never reach `on_frame`.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// Frame sent immediately after the socket opens.
    fn authenticate_frame(&self) -> UpstreamFrame;

    /// Startup burst written once upstream confirms the credential.
    fn on_ready(&self) -> Vec<UpstreamFrame>;

    /// Dispatch one upstream frame. Awaited inline so frames are processed
    /// in arrival order.
    async fn on_frame(&self, frame: UpstreamFrame);

    /// Connection lost with reconnect budget remaining.
    async fn on_disconnect(&self);

    /// The link will not come back.
    async fn on_close(&self, reason: CloseReason);
}

/// Owns one upstream WebSocket for one session.
///
/// State machine:
///
/// ```text
/// (Idle) → Connecting → Authenticating → Ready ⇄ Degraded → Closed
///                                          ↑           │
///                                          └─ backoff ─┘
/// ```
pub struct UpstreamLink<H: FrameHandler> {
    handler: Arc<H>,
    config: LinkConfig,
    state: Arc<LinkStateHandle>,
    command_rx: mpsc::Receiver<LinkCommand>,
}

impl<H: FrameHandler> UpstreamLink<H> {
    pub fn new(
        handler: H,
        config: LinkConfig,
        state: Arc<LinkStateHandle>,
        command_rx: mpsc::Receiver<LinkCommand>,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            config,
            state,
            command_rx,
        }
    }

    /// Run the link until it is shut down or goes terminal.
    pub async fn run(mut self) {
        let mut attempts_left = self.config.max_reconnects;

        loop {
            self.state.set(LinkState::Connecting);

            match self.connect_and_run(&mut attempts_left).await {
                Ok(reason) => {
                    self.state.set(LinkState::Closed);
                    info!(
                        "[{}] upstream link closed: {:?}",
                        self.config.session_label, reason
                    );
                    self.handler.on_close(reason).await;
                    return;
                }
                Err(e) => {
                    self.state.set(LinkState::Degraded);
                    counter!("proxy_upstream_disconnects_total").increment(1);
                    self.handler.on_disconnect().await;

                    if attempts_left == 0 {
                        self.state.set(LinkState::Closed);
                        warn!(
                            "[{}] upstream lost ({:?}), reconnect budget spent",
                            self.config.session_label, e
                        );
                        self.handler.on_close(CloseReason::ReconnectsExhausted).await;
                        return;
                    }

                    attempts_left -= 1;
                    counter!("proxy_upstream_reconnects_total").increment(1);
                    warn!(
                        "[{}] upstream lost ({:?}), reconnecting in {:?} ({} attempts left)",
                        self.config.session_label, e, self.config.reconnect_delay, attempts_left
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// One connection attempt. `Ok` carries the deliberate close reason;
    /// `Err` means the transport was lost and a reconnect may follow.
    async fn connect_and_run(&mut self, attempts_left: &mut u32) -> Result<CloseReason> {
        let handler = self.handler.clone();
        let state = self.state.clone();
        let label = self.config.session_label.clone();
        let max_reconnects = self.config.max_reconnects;

        info!("[{}] connecting upstream: {}", label, self.config.url);
        let (ws_stream, response) = connect_async(self.config.url.as_str()).await?;
        debug!(
            "[{}] upstream handshake complete, status {:?}",
            label,
            response.status()
        );

        let (mut write, mut read) = ws_stream.split();

        gauge!("proxy_upstream_connections").increment(1.0);
        let _connected = ConnectionGauge;

        // Session-credentialled handshake goes out first.
        state.set(LinkState::Authenticating);
        let auth = handler.authenticate_frame();
        write.send(Message::Text(auth.to_text()?.into())).await?;

        let mut ping_interval = interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping_interval.reset();

        loop {
            tokio::select! {
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text.to_string(),
                        Some(Ok(Message::Binary(data))) => {
                            // Some upstream revisions send JSON in binary frames.
                            match String::from_utf8(data.to_vec()) {
                                Ok(text) => text,
                                Err(_) => continue,
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                        Some(Ok(Message::Close(frame))) => {
                            info!("[{}] upstream sent close: {:?}", label, frame);
                            return Err(Error::ConnectionClosed);
                        }
                        Some(Err(e)) => return Err(Error::WebSocket(e)),
                        None => return Err(Error::ConnectionClosed),
                    };

                    counter!("proxy_upstream_frames_total").increment(1);
                    if let Some(reason) = route_frame(
                        &handler,
                        &state,
                        &label,
                        max_reconnects,
                        attempts_left,
                        &text,
                        &mut write,
                    )
                    .await?
                    {
                        return Ok(reason);
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(LinkCommand::Send(frame)) => {
                            debug!("[{}] → upstream {}", label, frame.name);
                            write.send(Message::Text(frame.to_text()?.into())).await?;
                        }
                        Some(LinkCommand::Shutdown) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(CloseReason::Shutdown);
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    if state.is_ready() {
                        write.send(
                            Message::Text(UpstreamFrame::bare(events::PING).to_text()?.into()),
                        ).await?;
                    }
                }
            }
        }
    }
}

/// Parse and route one upstream text payload. Returns a close reason for
/// terminal frames, `None` otherwise.
async fn route_frame<H, S>(
    handler: &Arc<H>,
    state: &LinkStateHandle,
    label: &str,
    max_reconnects: u32,
    attempts_left: &mut u32,
    text: &str,
    write: &mut S,
) -> Result<Option<CloseReason>>
where
    H: FrameHandler,
    S: SinkExt<Message> + Unpin,
    Error: From<S::Error>,
{
    let frame = match UpstreamFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            // A malformed frame is dropped; it must not kill the session.
            warn!("[{}] unparseable upstream frame ({}): {:.120}", label, e, text);
            counter!("proxy_upstream_parse_errors_total").increment(1);
            return Ok(None);
        }
    };

    match frame.name.as_str() {
        events::PING => {
            write
                .send(Message::Text(UpstreamFrame::bare(events::PONG).to_text()?.into()))
                .await?;
        }
        events::PONG | events::TIME_SYNC => {}
        events::AUTHENTICATED => {
            state.set(LinkState::Ready);
            *attempts_left = max_reconnects;
            info!("[{}] upstream session ready", label);

            // The acknowledgment reaches the client before any side effect
            // of the startup burst.
            handler.on_frame(frame).await;
            for burst in handler.on_ready() {
                write.send(Message::Text(burst.to_text()?.into())).await?;
            }
        }
        events::UNAUTHORIZED => {
            handler.on_frame(frame).await;
            return Ok(Some(CloseReason::AuthRejected));
        }
        _ => {
            handler.on_frame(frame).await;
        }
    }

    Ok(None)
}

struct ConnectionGauge;

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        gauge!("proxy_upstream_connections").decrement(1.0);
    }
}
