//! Candle shape normalization.

use serde_json::{json, Map, Value};

/// Normalize a `candle-generated` / `candles-generated` frame body into the
/// downstream candle shape: `max`/`min` become `high`/`low` and `size`
/// becomes `timeframe`.
///
/// Array bodies (and `{ candles: [...] }` wrappers) are normalized
/// element-wise.
pub fn normalize_candle(msg: &Value) -> Value {
    match msg {
        Value::Array(items) => Value::Array(items.iter().map(normalize_one).collect()),
        Value::Object(map) => match map.get("candles").and_then(Value::as_array) {
            Some(items) => json!({"candles": items.iter().map(normalize_one).collect::<Vec<_>>()}),
            None => normalize_one(msg),
        },
        other => other.clone(),
    }
}

fn normalize_one(candle: &Value) -> Value {
    let source = match candle.as_object() {
        Some(map) => map,
        None => return candle.clone(),
    };

    let mut out = Map::new();
    copy(source, &mut out, "open", "open");
    copy(source, &mut out, "close", "close");
    copy(source, &mut out, "max", "high");
    copy(source, &mut out, "high", "high");
    copy(source, &mut out, "min", "low");
    copy(source, &mut out, "low", "low");
    copy(source, &mut out, "from", "from");
    copy(source, &mut out, "to", "to");
    copy(source, &mut out, "size", "timeframe");
    copy(source, &mut out, "timeframe", "timeframe");
    copy(source, &mut out, "volume", "volume");
    copy(source, &mut out, "active_id", "active_id");
    Value::Object(out)
}

fn copy(source: &Map<String, Value>, out: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = source.get(from) {
        out.entry(to.to_string()).or_insert_with(|| value.clone());
    }
}
