//! Order construction: timeframe alignment, integer scaling, and the
//! `binary-options.open-option` envelope.

use crate::assets::AssetRegistry;
use crate::error::{ExchangeError, Result};
use common::UpstreamFrame;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Opaque upstream price scale. Observed constant; passed through unchanged.
pub const DEFAULT_PRICE: u64 = 10_000;

/// Default payout percentage attached to new orders.
pub const DEFAULT_PROFIT_PERCENT: u32 = 88;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Call,
    Put,
}

impl Direction {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "call" => Ok(Direction::Call),
            "put" => Ok(Direction::Put),
            other => Err(ExchangeError::BadOrder(format!(
                "direction must be call or put, got {other:?}"
            ))),
        }
    }
}

/// Expiry families the upstream sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    Custom(u32),
}

impl Timeframe {
    /// Upstream product-family code.
    pub fn option_kind(self) -> u32 {
        match self {
            Timeframe::M1 | Timeframe::Custom(_) => 3,
            Timeframe::M5 => 12,
            Timeframe::M15 => 13,
        }
    }

    /// Expiry instant: turn boundaries are rounded up to the next full
    /// period; custom expiries run from now.
    pub fn expiry(self, now_s: u64) -> u64 {
        match self {
            Timeframe::M1 => now_s.div_ceil(60) * 60,
            Timeframe::M5 => now_s.div_ceil(300) * 300,
            Timeframe::M15 => now_s.div_ceil(900) * 900,
            Timeframe::Custom(secs) => now_s + u64::from(secs),
        }
    }

    pub fn size_seconds(self) -> u32 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::Custom(secs) => secs,
        }
    }

    fn from_label(label: &str) -> Result<Self> {
        match label.to_ascii_uppercase().as_str() {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            other => Err(ExchangeError::BadOrder(format!("unknown timeframe {other:?}"))),
        }
    }

    fn from_option_kind(code: u32) -> Result<Self> {
        match code {
            3 => Ok(Timeframe::M1),
            12 => Ok(Timeframe::M5),
            13 => Ok(Timeframe::M15),
            other => Err(ExchangeError::BadOrder(format!(
                "unknown option_type_id {other}"
            ))),
        }
    }
}

/// Downstream `open-position` request. Field aliases cover the shapes sent
/// by the client generations still in the wild.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenPositionRequest {
    pub direction: Option<String>,
    #[serde(alias = "stake")]
    pub amount: Option<f64>,
    pub active_id: Option<Value>,
    pub option_type_id: Option<u32>,
    pub timeframe: Option<String>,
    #[serde(alias = "duration")]
    pub expiration_size: Option<u32>,
    pub price: Option<u64>,
    pub profit_percent: Option<u32>,
    pub refund_value: Option<u64>,
}

/// Session state an order draws on.
#[derive(Debug, Clone)]
pub struct OrderContext<'a> {
    pub registry: &'a AssetRegistry,
    /// Latest balance id seen from upstream, if any.
    pub user_balance_id: Option<Value>,
    /// Active the session is currently subscribed to, if any.
    pub current_active: Option<u32>,
}

/// Fully validated upstream order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderEnvelope {
    pub request_id: String,
    pub local_time: u64,
    pub user_balance_id: Value,
    pub active_id: u32,
    pub option_type_id: u32,
    pub direction: Direction,
    pub expiration_size: u32,
    pub expired: u64,
    pub price: u64,
    pub profit_percent: u32,
    pub refund_value: u64,
    /// Stake in minor units.
    pub value: i64,
}

impl OrderEnvelope {
    /// The `binary-options.open-option` v2.0 wire frame.
    pub fn to_frame(&self) -> UpstreamFrame {
        UpstreamFrame::named(
            "binary-options.open-option",
            json!({
                "user_balance_id": self.user_balance_id,
                "active_id": self.active_id,
                "option_type_id": self.option_type_id,
                "direction": self.direction,
                "expiration_size": self.expiration_size,
                "expired": self.expired,
                "price": self.price,
                "profit_percent": self.profit_percent,
                "refund_value": self.refund_value,
                "value": self.value,
            }),
        )
        .with_version("2.0")
        .with_request_id(self.request_id.clone())
        .with_local_time(self.local_time)
    }
}

/// Build and validate an order envelope.
///
/// `request_id` and `local_time` are supplied by the session so that two
/// builds from identical inputs differ only in those two fields.
pub fn build_order(
    request: &OpenPositionRequest,
    context: &OrderContext<'_>,
    now_s: u64,
    request_id: String,
    local_time: u64,
) -> Result<OrderEnvelope> {
    let direction = match request.direction.as_deref() {
        Some(raw) => Direction::parse(raw)?,
        None => return Err(ExchangeError::BadOrder("direction is required".to_string())),
    };

    let stake = request
        .amount
        .ok_or_else(|| ExchangeError::BadOrder("amount is required".to_string()))?;
    if stake <= 0.0 {
        return Err(ExchangeError::BadOrder(format!("stake must be positive, got {stake}")));
    }

    let user_balance_id = context
        .user_balance_id
        .clone()
        .ok_or_else(|| ExchangeError::BadOrder("no balance id known yet".to_string()))?;

    let active_id = match &request.active_id {
        Some(payload) => context.registry.resolve(payload)?.0,
        None => context
            .current_active
            .ok_or_else(|| ExchangeError::BadOrder("no active subscribed or given".to_string()))?,
    };

    let timeframe = if let Some(label) = &request.timeframe {
        Timeframe::from_label(label)?
    } else if let Some(secs) = request.expiration_size {
        Timeframe::Custom(secs)
    } else if let Some(code) = request.option_type_id {
        Timeframe::from_option_kind(code)?
    } else {
        Timeframe::M1
    };

    let option_type_id = match request.option_type_id {
        // An explicit code wins, but only codes we can sell.
        Some(code) => Timeframe::from_option_kind(code).map(|_| code)?,
        None => timeframe.option_kind(),
    };

    Ok(OrderEnvelope {
        request_id,
        local_time,
        user_balance_id,
        active_id,
        option_type_id,
        direction,
        expiration_size: timeframe.size_seconds(),
        expired: timeframe.expiry(now_s),
        price: request.price.unwrap_or(DEFAULT_PRICE),
        profit_percent: request.profit_percent.unwrap_or(DEFAULT_PROFIT_PERCENT),
        refund_value: request.refund_value.unwrap_or(0),
        value: (stake * 100.0).round() as i64,
    })
}
