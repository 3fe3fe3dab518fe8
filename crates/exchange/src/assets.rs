//! Asset registry: textual instrument names to upstream numeric ids.

use crate::error::{ExchangeError, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Asset subscribed on behalf of every fresh session.
pub const DEFAULT_ACTIVE: &str = "EURUSD-OTC";

/// Built-in instrument table. OTC and BLZ instruments are distinguished only
/// by id range; deployments extend this via `ASSETS_FILE`.
const BUILTIN_ASSETS: &[(&str, u32)] = &[
    ("EURUSD", 1),
    ("EURGBP", 2),
    ("GBPJPY", 3),
    ("EURJPY", 4),
    ("GBPUSD", 5),
    ("USDJPY", 6),
    ("AUDCAD", 7),
    ("NZDUSD", 8),
    ("USDCHF", 72),
    ("EURUSD-OTC", 76),
    ("EURGBP-OTC", 77),
    ("USDCHF-OTC", 78),
    ("EURJPY-OTC", 79),
    ("NZDUSD-OTC", 80),
    ("GBPUSD-OTC", 81),
    ("GBPJPY-OTC", 84),
    ("USDJPY-OTC", 85),
    ("AUDCAD-OTC", 86),
    ("AUDUSD-OTC", 99),
    ("USDCAD-OTC", 100),
    ("BTCUSD-BLZ", 2270),
    ("ETHUSD-BLZ", 2271),
];

/// Immutable process-wide mapping between instrument names and upstream ids.
/// Built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct AssetRegistry {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
}

impl AssetRegistry {
    /// Registry with the built-in table only.
    pub fn with_defaults() -> Self {
        Self::from_pairs(BUILTIN_ASSETS.iter().map(|(n, i)| (n.to_string(), *i)))
    }

    /// Registry from explicit pairs. Later entries win on collision, so
    /// callers can layer a config file over the defaults.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, u32)>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        for (name, id) in pairs {
            by_id.insert(id, name.clone());
            by_name.insert(name, id);
        }
        Self { by_name, by_id }
    }

    /// Merge additional pairs over this registry.
    pub fn extend(&mut self, pairs: impl IntoIterator<Item = (String, u32)>) {
        for (name, id) in pairs {
            self.by_id.insert(id, name.clone());
            self.by_name.insert(name, id);
        }
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Id of the default active every session subscribes to on startup.
    pub fn default_active(&self) -> (u32, String) {
        let id = self.by_name.get(DEFAULT_ACTIVE).copied().unwrap_or(76);
        (id, DEFAULT_ACTIVE.to_string())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Resolve a subscription payload to `(id, textual name)`.
    ///
    /// Clients from several app generations send different shapes: a bare
    /// name, a bare numeric id, or an object keyed by `active`, `name`, `id`,
    /// a nested `msg.name`, or `payload`. Resolution is a pure function of
    /// the registry and the input.
    pub fn resolve(&self, payload: &Value) -> Result<(u32, String)> {
        match payload {
            Value::String(name) => match self.by_name.get(name.as_str()) {
                Some(id) => Ok((*id, name.clone())),
                None => Err(ExchangeError::UnknownAsset(name.clone())),
            },
            Value::Number(n) => match n.as_u64() {
                Some(id) => {
                    let id = id as u32;
                    let name = self
                        .name_of(id)
                        .map(str::to_string)
                        .unwrap_or_else(|| id.to_string());
                    Ok((id, name))
                }
                None => Err(ExchangeError::UnknownAsset(n.to_string())),
            },
            Value::Object(map) => {
                for key in ["active", "name", "id"] {
                    if let Some(inner) = map.get(key) {
                        return self.resolve(inner);
                    }
                }
                if let Some(inner) = map.get("msg").and_then(|m| m.get("name")) {
                    return self.resolve(inner);
                }
                if let Some(inner) = map.get("payload") {
                    return self.resolve(inner);
                }
                Err(ExchangeError::UnknownAsset(payload.to_string()))
            }
            other => Err(ExchangeError::UnknownAsset(other.to_string())),
        }
    }
}
