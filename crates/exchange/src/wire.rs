//! Outgoing upstream frame builders.

use common::UpstreamFrame;
use serde_json::json;

/// Upstream protocol version sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 3;

/// Minute-candle window requested on subscribe.
pub const CANDLE_SIZE: u32 = 60;

/// Candle timeframe label.
pub const CANDLE_TIMEFRAME: &str = "1m";

/// Session-credentialled handshake frame.
pub fn authenticate(ssid: &str) -> UpstreamFrame {
    UpstreamFrame::named(
        "authenticate",
        json!({
            "ssid": ssid,
            "protocol": PROTOCOL_VERSION,
            "client_session_id": "",
        }),
    )
}

pub fn get_balances() -> UpstreamFrame {
    UpstreamFrame::named("balances.get-balances", json!({}))
}

pub fn subscribe_positions() -> UpstreamFrame {
    UpstreamFrame::named("subscribe-positions", json!({"frequency": "frequent"}))
}

pub fn get_all_actives() -> UpstreamFrame {
    UpstreamFrame::named("actives.get-all", json!({}))
}

pub fn subscribe_candles(active_id: u32) -> UpstreamFrame {
    UpstreamFrame::named(
        "subscribe-candles",
        json!({
            "active_id": active_id,
            "size": CANDLE_SIZE,
            "at": CANDLE_TIMEFRAME,
        }),
    )
}

pub fn unsubscribe_candles(active_id: u32) -> UpstreamFrame {
    UpstreamFrame::named("unsubscribe-candles", json!({"active_id": active_id}))
}

/// `sendMessage`-wrapped variant of a frame. Upstream revisions have accepted
/// either the direct or the wrapped shape; the redundant one is ignored.
pub fn wrapped(frame: &UpstreamFrame) -> UpstreamFrame {
    let mut inner = json!({"name": frame.name});
    if let Some(msg) = &frame.msg {
        inner["msg"] = msg.clone();
    }
    if let Some(version) = &frame.version {
        inner["version"] = json!(version);
    }
    UpstreamFrame::named("sendMessage", inner)
}
