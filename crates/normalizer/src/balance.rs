//! Balance normalization: heterogeneous upstream balance shapes to the
//! canonical cents-valued record.

use crate::schema::{AccountFlavor, CanonicalBalance};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Upstream type-code marking a real-money account.
const REAL_TYPE_CODE: i64 = 1;

/// Upstream type-code marking a practice account.
const DEMO_TYPE_CODE: i64 = 4;

/// Integer amounts above this are already minor units.
const MINOR_UNITS_FLOOR: i64 = 100_000;

/// One record as upstream sends it, in any of its shapes.
#[derive(Debug, Clone, Deserialize)]
struct RawBalance {
    #[serde(default)]
    id: Value,
    amount: Option<Value>,
    currency: Option<String>,
    #[serde(rename = "type")]
    type_code: Option<i64>,
    is_demo: Option<bool>,
}

impl RawBalance {
    fn is_demo_account(&self) -> bool {
        self.type_code == Some(DEMO_TYPE_CODE) || self.is_demo == Some(true)
    }

    fn is_real_account(&self) -> bool {
        self.type_code == Some(REAL_TYPE_CODE)
            || (self.type_code != Some(DEMO_TYPE_CODE) && self.is_demo != Some(true))
    }
}

/// Normalize a `balance-changed` or `balances` frame body.
///
/// Accepts a single record, a `{ current_balance: ... }` wrapper, or an
/// array of records, and selects the record matching the requested account
/// flavor. Returns `None` when no usable record is present.
pub fn normalize_balance(msg: &Value, flavor: AccountFlavor) -> Option<CanonicalBalance> {
    let records = collect_records(msg);
    if records.is_empty() {
        return None;
    }

    let chosen = match flavor {
        AccountFlavor::Demo => records.iter().find(|r| r.is_demo_account()),
        AccountFlavor::Real => records.iter().find(|r| r.is_real_account()),
    };

    let chosen = match chosen {
        Some(record) => record,
        None => {
            // Shape heuristic missed; fall back rather than fail the session.
            warn!(
                "no balance matched flavor {:?} among {} records, using fallback",
                flavor,
                records.len()
            );
            records
                .iter()
                .find(|r| r.currency.as_deref() == Some("USD"))
                .unwrap_or(&records[0])
        }
    };

    let amount_cents = chosen.amount.as_ref().and_then(to_cents).unwrap_or(0);
    let record_flavor = if chosen.is_demo_account() {
        AccountFlavor::Demo
    } else {
        AccountFlavor::Real
    };

    Some(CanonicalBalance {
        id: chosen.id.clone(),
        amount_cents,
        currency: chosen.currency.clone().unwrap_or_else(|| "USD".to_string()),
        flavor: record_flavor,
    })
}

fn collect_records(msg: &Value) -> Vec<RawBalance> {
    let values: Vec<Value> = match msg {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("current_balance") {
            Some(inner) => vec![inner.clone()],
            None => vec![msg.clone()],
        },
        _ => Vec::new(),
    };

    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<RawBalance>(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("skipping unreadable balance record: {}", e);
                None
            }
        })
        .collect()
}

/// Amount conversion heuristic. Upstream amounts arrive either as decimals
/// in major units or as large integers already in minor units:
/// non-integers are scaled by 100 and rounded; integers above the floor are
/// taken as minor units; small integers are scaled by 100.
fn to_cents(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(if n > MINOR_UNITS_FLOOR { n } else { n * 100 });
    }
    let f = value.as_f64()?;
    if f.fract() != 0.0 {
        Some((f * 100.0).round() as i64)
    } else if f > MINOR_UNITS_FLOOR as f64 {
        Some(f as i64)
    } else {
        Some((f * 100.0).round() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decimal_major_units_are_scaled() {
        let msg = json!([{"currency": "USD", "amount": 98695.57, "id": "bx-1", "type": 1}]);
        let balance = normalize_balance(&msg, AccountFlavor::Real).unwrap();

        assert_eq!(balance.id, json!("bx-1"));
        assert_eq!(balance.amount_cents, 9_869_557);
        assert_eq!(balance.currency, "USD");
        assert_eq!(
            balance.to_payload(),
            json!({"msg": {"current_balance": {"id": "bx-1", "amount": 9869557, "currency": "USD"}}})
        );
    }

    #[test]
    fn test_demo_flavor_selects_type_four() {
        let msg = json!([
            {"currency": "USD", "amount": 100.0, "id": 11, "type": 1},
            {"currency": "USD", "amount": 10000.0, "id": 22, "type": 4},
        ]);
        let balance = normalize_balance(&msg, AccountFlavor::Demo).unwrap();
        assert_eq!(balance.id, json!(22));
        assert_eq!(balance.flavor, AccountFlavor::Demo);
    }

    #[test]
    fn test_demo_flag_counts_as_demo() {
        let msg = json!([
            {"currency": "USD", "amount": 100.0, "id": 11, "type": 1},
            {"currency": "USD", "amount": 200.0, "id": 33, "is_demo": true},
        ]);
        let balance = normalize_balance(&msg, AccountFlavor::Demo).unwrap();
        assert_eq!(balance.id, json!(33));
    }

    #[test]
    fn test_real_flavor_skips_demo_records() {
        let msg = json!([
            {"currency": "USD", "amount": 10000.0, "id": 22, "type": 4},
            {"currency": "USD", "amount": 100.0, "id": 11, "type": 1},
        ]);
        let balance = normalize_balance(&msg, AccountFlavor::Real).unwrap();
        assert_eq!(balance.id, json!(11));
        assert_eq!(balance.flavor, AccountFlavor::Real);
    }

    #[test]
    fn test_fallback_prefers_usd() {
        // Demo requested but only real records exist.
        let msg = json!([
            {"currency": "BRL", "amount": 50.0, "id": 1, "type": 1},
            {"currency": "USD", "amount": 60.0, "id": 2, "type": 1},
        ]);
        let balance = normalize_balance(&msg, AccountFlavor::Demo).unwrap();
        assert_eq!(balance.id, json!(2));
    }

    #[test]
    fn test_single_record_wrapper_shapes() {
        let wrapped = json!({"current_balance": {"currency": "USD", "amount": 12.5, "id": "b"}});
        assert_eq!(
            normalize_balance(&wrapped, AccountFlavor::Real).unwrap().amount_cents,
            1250
        );

        let bare = json!({"currency": "USD", "amount": 12.5, "id": "b"});
        assert_eq!(
            normalize_balance(&bare, AccountFlavor::Real).unwrap().amount_cents,
            1250
        );
    }

    #[test]
    fn test_empty_input_yields_none() {
        assert!(normalize_balance(&json!([]), AccountFlavor::Real).is_none());
        assert!(normalize_balance(&json!(null), AccountFlavor::Real).is_none());
    }

    #[test]
    fn test_to_cents_heuristic() {
        // Non-integer: major units.
        assert_eq!(to_cents(&json!(98695.57)), Some(9_869_557));
        // Large integer: already minor units.
        assert_eq!(to_cents(&json!(9_869_557)), Some(9_869_557));
        // Small integer: major units.
        assert_eq!(to_cents(&json!(150)), Some(15_000));
        // Integral float follows the integer rules.
        assert_eq!(to_cents(&json!(150.0)), Some(15_000));
        assert_eq!(to_cents(&json!(9_869_557.0)), Some(9_869_557));
    }

    #[test]
    fn test_cents_input_is_idempotent() {
        let msg = json!([{"currency": "USD", "amount": 9_869_557, "id": "bx-1", "type": 1}]);
        let first = normalize_balance(&msg, AccountFlavor::Real).unwrap();

        let again = json!([
            {"currency": "USD", "amount": first.amount_cents, "id": "bx-1", "type": 1}
        ]);
        let second = normalize_balance(&again, AccountFlavor::Real).unwrap();
        assert_eq!(first, second);
    }
}
