//! Session mediator: binds one downstream channel to one upstream link and
//! applies the translation policies between them.

use crate::aggregator::EventAggregator;
use crate::error::{GatewayError, Result};
use crate::protocol::DownstreamEvent;
use crate::registry::{SessionId, SessionIndex};
use async_trait::async_trait;
use chrono::Utc;
use common::{
    CloseReason, FrameHandler, LinkCommand, LinkConfig, LinkStateHandle, UpstreamFrame,
    UpstreamLink,
};
use exchange::orders::build_order;
use exchange::{wire, AssetRegistry, OpenPositionRequest, OrderContext};
use metrics::counter;
use normalizer::{normalize_balance, normalize_candle, AccountFlavor, CanonicalBalance};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Downstream heartbeat period, so intermediaries never see an idle channel.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Sweep cadence for expired order correlations.
const ORDER_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// How long an order correlation stays armed.
const ORDER_CORRELATION_TTL: Duration = Duration::from_secs(12);

/// Position states that settle an order.
const SETTLED_POSITION_STATUSES: &[&str] = &["closed", "expired", "sold"];

/// Per-session configuration supplied by the acceptor.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub upstream_url: String,
}

/// State shared between the mediator, the frame handler, the housekeeping
/// task, and the session index. Mutated only by session-owned tasks.
pub struct SessionShared {
    pub id: SessionId,
    pub credential: String,
    pub flavor: AccountFlavor,
    pub assets: Arc<AssetRegistry>,
    pub created_at: i64,
    egress: mpsc::UnboundedSender<DownstreamEvent>,
    balance: RwLock<Option<CanonicalBalance>>,
    current_active: RwLock<Option<(u32, String)>>,
    pending_orders: Mutex<HashMap<String, Instant>>,
    request_seq: AtomicU64,
    started_at: Instant,
}

impl SessionShared {
    fn new(
        credential: String,
        flavor: AccountFlavor,
        assets: Arc<AssetRegistry>,
        egress: mpsc::UnboundedSender<DownstreamEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            credential,
            flavor,
            assets,
            created_at: Utc::now().timestamp_millis(),
            egress,
            balance: RwLock::new(None),
            current_active: RwLock::new(None),
            pending_orders: Mutex::new(HashMap::new()),
            request_seq: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    fn emit(&self, event: DownstreamEvent) {
        let _ = self.egress.send(event);
    }

    pub fn balance(&self) -> Option<CanonicalBalance> {
        self.balance.read().unwrap().clone()
    }

    pub fn balance_id(&self) -> Option<Value> {
        self.balance
            .read()
            .unwrap()
            .as_ref()
            .map(|b| b.id.clone())
    }

    fn set_balance(&self, balance: CanonicalBalance) {
        *self.balance.write().unwrap() = Some(balance);
    }

    pub fn current_active(&self) -> Option<(u32, String)> {
        self.current_active.read().unwrap().clone()
    }

    fn set_current_active(&self, id: u32, name: String) {
        *self.current_active.write().unwrap() = Some((id, name));
    }

    /// Fresh monotonically-unique order correlation id.
    fn next_request_id(&self) -> String {
        (self.request_seq.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Session-local time tick in milliseconds.
    fn local_time(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn register_order(&self, request_id: &str) {
        self.pending_orders
            .lock()
            .unwrap()
            .insert(request_id.to_string(), Instant::now());
    }

    /// Claim a pending correlation. Returns false for unknown or already
    /// expired ids.
    fn take_pending_order(&self, request_id: &str) -> bool {
        self.pending_orders
            .lock()
            .unwrap()
            .remove(request_id)
            .is_some()
    }

    /// Drop correlations past the TTL; returns how many were dropped.
    pub fn expire_stale_orders(&self) -> usize {
        let mut pending = self.pending_orders.lock().unwrap();
        let before = pending.len();
        pending.retain(|_, sent_at| sent_at.elapsed() < ORDER_CORRELATION_TTL);
        before - pending.len()
    }
}

/// Upstream frame dispatcher for one session. Implements the event table:
/// balances are normalized into the compatibility trio, candle-like classes
/// go through the aggregator, everything else is forwarded under its own
/// name.
struct SessionEventHandler {
    shared: Arc<SessionShared>,
    aggregator: EventAggregator,
}

impl SessionEventHandler {
    fn handle_balance(&self, frame: &UpstreamFrame) {
        let body = frame.payload();
        match normalize_balance(&body, self.shared.flavor) {
            Some(balance) => {
                let payload = balance.to_payload();
                self.shared.set_balance(balance);
                self.aggregator.admit("balance-changed", payload);
            }
            None => warn!("[{}] balance frame with no usable record", self.shared.id),
        }
    }

    fn finish_order(&self, request_id: &str, frame: &UpstreamFrame) {
        let raw = frame.payload();
        let success = raw
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let payload = json!({"request_id": request_id, "raw": raw});
        if success {
            counter!("proxy_orders_confirmed_total").increment(1);
            self.shared
                .emit(DownstreamEvent::new("order-confirmed", payload));
        } else {
            counter!("proxy_orders_rejected_total").increment(1);
            self.shared.emit(DownstreamEvent::new("order-error", payload));
        }
    }
}

#[async_trait]
impl FrameHandler for SessionEventHandler {
    fn authenticate_frame(&self) -> UpstreamFrame {
        wire::authenticate(&self.shared.credential)
    }

    fn on_ready(&self) -> Vec<UpstreamFrame> {
        let (id, name) = self.shared.assets.default_active();
        self.shared.set_current_active(id, name);

        let subscribe = wire::subscribe_candles(id);
        let wrapped = wire::wrapped(&subscribe);
        vec![
            wire::get_balances(),
            wire::subscribe_positions(),
            wire::get_all_actives(),
            subscribe,
            wrapped,
        ]
    }

    async fn on_frame(&self, frame: UpstreamFrame) {
        counter!("proxy_frames_dispatched_total").increment(1);

        // A pending order claims any frame carrying its request id.
        if let Some(request_id) = frame.request_id.clone() {
            if self.shared.take_pending_order(&request_id) {
                self.finish_order(&request_id, &frame);
                return;
            }
        }

        match frame.name.as_str() {
            "authenticated" => self
                .shared
                .emit(DownstreamEvent::new("authenticated", frame.payload())),
            "unauthorized" => self
                .shared
                .emit(DownstreamEvent::new("unauthorized", frame.payload())),
            "balance-changed" | "balances" => self.handle_balance(&frame),
            "candle-generated" | "candles-generated" => {
                self.aggregator
                    .admit("candles", normalize_candle(&frame.payload()));
            }
            "positions-state" => {
                self.aggregator.admit("positions", frame.payload());
            }
            "position-changed" => {
                let payload = frame.payload();
                self.shared
                    .emit(DownstreamEvent::new("position-changed", payload.clone()));
                if position_is_settled(&payload) {
                    self.shared
                        .emit(DownstreamEvent::new("order-result", payload));
                }
            }
            "client-buyback-generated" | "price-splitter.client-buyback-generated" => {
                self.aggregator.admit("pressure", frame.payload());
            }
            name => self
                .shared
                .emit(DownstreamEvent::new(name.to_string(), frame.payload())),
        }
    }

    async fn on_disconnect(&self) {
        // Reconnects are silent until the budget is spent.
        debug!("[{}] upstream connection lost, link is retrying", self.shared.id);
    }

    async fn on_close(&self, reason: CloseReason) {
        self.aggregator.clear();
        match reason {
            CloseReason::AuthRejected => {
                // `unauthorized` was already forwarded by the dispatch table.
                self.shared.emit(DownstreamEvent::disconnected());
            }
            CloseReason::ReconnectsExhausted => {
                self.shared
                    .emit(DownstreamEvent::error("upstream connection lost"));
                self.shared.emit(DownstreamEvent::disconnected());
            }
            CloseReason::Shutdown => {}
        }
    }
}

fn position_is_settled(payload: &Value) -> bool {
    payload
        .get("status")
        .and_then(Value::as_str)
        .map(|status| SETTLED_POSITION_STATUSES.contains(&status))
        .unwrap_or(false)
}

/// One downstream client's session: the upstream link, the aggregator, and
/// the housekeeping timers.
pub struct Session {
    shared: Arc<SessionShared>,
    link_state: Arc<LinkStateHandle>,
    link_tx: mpsc::Sender<LinkCommand>,
    aggregator: EventAggregator,
    index: Arc<SessionIndex>,
    link_task: JoinHandle<()>,
    housekeeping_task: JoinHandle<()>,
}

impl Session {
    /// Create the session and spawn its tasks. The upstream handshake starts
    /// immediately.
    pub fn spawn(
        credential: String,
        flavor: AccountFlavor,
        assets: Arc<AssetRegistry>,
        index: Arc<SessionIndex>,
        egress: mpsc::UnboundedSender<DownstreamEvent>,
        config: SessionConfig,
    ) -> Self {
        let shared = Arc::new(SessionShared::new(credential, flavor, assets, egress.clone()));
        let aggregator = EventAggregator::with_defaults(egress);
        let link_state = Arc::new(LinkStateHandle::new());
        let (link_tx, link_rx) = mpsc::channel(32);

        let handler = SessionEventHandler {
            shared: shared.clone(),
            aggregator: aggregator.clone(),
        };
        let link_config = LinkConfig {
            url: config.upstream_url,
            session_label: shared.id.to_string(),
            ..Default::default()
        };
        let link = UpstreamLink::new(handler, link_config, link_state.clone(), link_rx);
        let link_task = tokio::spawn(link.run());

        let housekeeping_task = tokio::spawn(housekeeping(shared.clone()));

        index.insert(shared.clone(), link_state.clone());
        counter!("proxy_sessions_total").increment(1);
        info!("session {} created (flavor {:?})", shared.id, shared.flavor);

        Self {
            shared,
            link_state,
            link_tx,
            aggregator,
            index,
            link_task,
            housekeeping_task,
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.link_state.is_ready() {
            Ok(())
        } else {
            Err(GatewayError::NotReady)
        }
    }

    async fn send_upstream(&self, frame: UpstreamFrame) -> Result<()> {
        self.link_tx
            .send(LinkCommand::Send(frame))
            .await
            .map_err(|_| GatewayError::ChannelSend)
    }

    /// Switch candle streaming to the given instrument.
    pub async fn subscribe_active(&self, payload: &Value) -> Result<()> {
        self.ensure_ready()?;
        let (id, name) = self.shared.assets.resolve(payload)?;

        if let Some((old_id, _)) = self.shared.current_active() {
            if old_id != id {
                self.send_upstream(wire::unsubscribe_candles(old_id)).await?;
            }
        }

        // Upstream has historically accepted either form; the redundant one
        // is a no-op there.
        let subscribe = wire::subscribe_candles(id);
        self.send_upstream(subscribe.clone()).await?;
        self.send_upstream(wire::wrapped(&subscribe)).await?;

        self.shared.set_current_active(id, name.clone());
        self.shared.emit(DownstreamEvent::new(
            "subscribed-active",
            json!([{"name": name, "id": id}]),
        ));
        Ok(())
    }

    /// Raw pass-through: forward the envelope's `msg` when present, else the
    /// envelope itself.
    pub async fn send_raw(&self, envelope: Value) -> Result<()> {
        self.ensure_ready()?;
        let inner = match envelope.get("msg") {
            Some(msg) => msg.clone(),
            None => envelope,
        };
        let frame: UpstreamFrame = serde_json::from_value(inner)?;
        self.send_upstream(frame).await
    }

    /// Build, announce, and transmit an order; arm the result correlation.
    pub async fn open_position(&self, request: &OpenPositionRequest) -> Result<()> {
        self.ensure_ready()?;

        let context = OrderContext {
            registry: self.shared.assets.as_ref(),
            user_balance_id: self.shared.balance_id(),
            current_active: self.shared.current_active().map(|(id, _)| id),
        };
        let envelope = build_order(
            request,
            &context,
            Utc::now().timestamp() as u64,
            self.shared.next_request_id(),
            self.shared.local_time(),
        )?;
        let request_id = envelope.request_id.clone();
        let frame = envelope.to_frame();

        // `order-sent` reaches the client before any correlated outcome.
        self.shared.register_order(&request_id);
        self.shared.emit(DownstreamEvent::new(
            "order-sent",
            json!({"request_id": request_id, "envelope": envelope}),
        ));
        self.send_upstream(frame).await?;
        counter!("proxy_orders_sent_total").increment(1);
        Ok(())
    }

    /// Report the cached balance (zero before upstream has answered) under
    /// the compatibility trio.
    pub fn report_balance(&self) {
        let balance = self.shared.balance().unwrap_or_else(CanonicalBalance::zero);
        let payload = balance.to_payload();
        for name in ["balance", "balance-changed", "current-balance"] {
            self.shared.emit(DownstreamEvent::new(name, payload.clone()));
        }
    }

    /// Tear the session down: cancel timers, drop buffers, close the
    /// upstream socket (best-effort), and leave the index.
    pub async fn teardown(mut self) {
        self.aggregator.clear();
        self.housekeeping_task.abort();
        self.index.remove(self.shared.id);

        let _ = self.link_tx.try_send(LinkCommand::Shutdown);
        if tokio::time::timeout(Duration::from_millis(250), &mut self.link_task)
            .await
            .is_err()
        {
            // Link stuck in backoff or a slow close; drop the socket hard.
            self.link_task.abort();
        }

        counter!("proxy_sessions_destroyed_total").increment(1);
        info!("session {} destroyed", self.shared.id);
    }
}

/// Timer-driven per-session chores: the downstream heartbeat and the order
/// correlation sweep.
async fn housekeeping(shared: Arc<SessionShared>) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut sweep = tokio::time::interval(ORDER_SWEEP_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.reset();
    sweep.reset();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                shared.emit(DownstreamEvent::new(
                    "ping-proxy",
                    json!({"t": Utc::now().timestamp_millis()}),
                ));
            }
            _ = sweep.tick() => {
                let expired = shared.expire_stale_orders();
                if expired > 0 {
                    debug!("[{}] expired {} order correlations", shared.id, expired);
                }
            }
        }
    }
}
