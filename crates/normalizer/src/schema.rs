//! Canonical schema for values emitted downstream.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Account flavor requested by the downstream client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountFlavor {
    #[default]
    Real,
    Demo,
}

/// Canonical balance record. Amounts are always minor units (integer cents).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalBalance {
    /// Upstream balance id, kept verbatim (string or number).
    pub id: Value,
    pub amount_cents: i64,
    pub currency: String,
    pub flavor: AccountFlavor,
}

impl CanonicalBalance {
    /// Empty balance reported before upstream has answered.
    pub fn zero() -> Self {
        Self {
            id: Value::Null,
            amount_cents: 0,
            currency: "USD".to_string(),
            flavor: AccountFlavor::Real,
        }
    }

    /// Downstream payload shared by the `balance` / `balance-changed` /
    /// `current-balance` compatibility trio.
    pub fn to_payload(&self) -> Value {
        json!({
            "msg": {
                "current_balance": {
                    "id": self.id,
                    "amount": self.amount_cents,
                    "currency": self.currency,
                }
            }
        })
    }
}
