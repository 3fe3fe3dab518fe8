//! Per-session event aggregator: rate-limited, coalescing fan-out of
//! high-frequency upstream event classes.
//!
//! Upstream emits candle-like events at tens of Hz per instrument. Each
//! rate-limited class keeps only the most recent payload and flushes it on a
//! short deferred deadline; the per-window budget bounds total egress.

use crate::protocol::DownstreamEvent;
use metrics::counter;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Deferred-flush delay for coalesced payloads.
pub const FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Rate and naming policy for one event class.
#[derive(Debug, Clone)]
pub struct ClassConfig {
    /// Rate-limit window length.
    pub interval: Duration,
    /// Downstream emissions allowed per window.
    pub max_per_window: u32,
    /// Names the flushed payload is emitted under, friendly name first.
    pub emit_names: Vec<String>,
}

impl ClassConfig {
    pub fn new(interval: Duration, max_per_window: u32, emit_names: &[&str]) -> Self {
        Self {
            interval,
            max_per_window,
            emit_names: emit_names.iter().map(|n| n.to_string()).collect(),
        }
    }
}

/// Default policy table. The balance trio and the buyback name fan-out exist
/// for compatibility with deployed clients.
pub fn default_classes() -> HashMap<String, ClassConfig> {
    HashMap::from([
        (
            "candles".to_string(),
            ClassConfig::new(Duration::from_millis(500), 5, &["candles"]),
        ),
        (
            "positions".to_string(),
            ClassConfig::new(Duration::from_millis(500), 5, &["positions"]),
        ),
        (
            "balance-changed".to_string(),
            ClassConfig::new(
                Duration::from_millis(1000),
                4,
                &["balance", "balance-changed", "current-balance"],
            ),
        ),
        (
            "pressure".to_string(),
            ClassConfig::new(
                Duration::from_millis(1000),
                4,
                &[
                    "pressure",
                    "client-buyback-generated",
                    "price-splitter.client-buyback-generated",
                ],
            ),
        ),
    ])
}

/// Emission budget for one window.
struct RateBucket {
    count: u32,
    window_reset: Instant,
}

/// At most one pending payload per class; a flush task implies a payload.
struct CoalesceSlot {
    pending: Option<Value>,
    flush_task: Option<JoinHandle<()>>,
}

struct ClassState {
    config: ClassConfig,
    bucket: RateBucket,
    slot: CoalesceSlot,
}

struct Inner {
    classes: Mutex<HashMap<String, ClassState>>,
    egress: mpsc::UnboundedSender<DownstreamEvent>,
    flush_delay: Duration,
}

impl Inner {
    fn flush(&self, class: &str) {
        let (payload, names) = {
            let mut classes = self.classes.lock().unwrap();
            let state = match classes.get_mut(class) {
                Some(state) => state,
                None => return,
            };
            state.slot.flush_task = None;
            (state.slot.pending.take(), state.config.emit_names.clone())
        };

        if let Some(payload) = payload {
            for name in names {
                let _ = self.egress.send(DownstreamEvent::new(name, payload.clone()));
            }
            counter!("proxy_aggregator_flushes_total").increment(1);
        }
    }
}

/// Cheaply cloneable handle; clones share the same slots and buckets.
#[derive(Clone)]
pub struct EventAggregator {
    inner: Arc<Inner>,
}

impl EventAggregator {
    pub fn new(
        egress: mpsc::UnboundedSender<DownstreamEvent>,
        classes: HashMap<String, ClassConfig>,
    ) -> Self {
        let now = Instant::now();
        let classes = classes
            .into_iter()
            .map(|(name, config)| {
                (
                    name,
                    ClassState {
                        config,
                        bucket: RateBucket {
                            count: 0,
                            window_reset: now,
                        },
                        slot: CoalesceSlot {
                            pending: None,
                            flush_task: None,
                        },
                    },
                )
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                classes: Mutex::new(classes),
                egress,
                flush_delay: FLUSH_DELAY,
            }),
        }
    }

    pub fn with_defaults(egress: mpsc::UnboundedSender<DownstreamEvent>) -> Self {
        Self::new(egress, default_classes())
    }

    /// Whether a class is rate-limited by this aggregator.
    pub fn handles(&self, class: &str) -> bool {
        self.inner.classes.lock().unwrap().contains_key(class)
    }

    /// Offer a payload to a class. Returns true when the payload was
    /// accepted: it overwrites the pending slot and a flush is scheduled if
    /// one is not already. Returns false when the window budget is spent and
    /// no flush is pending; the payload is dropped.
    pub fn admit(&self, class: &str, payload: Value) -> bool {
        let mut classes = self.inner.classes.lock().unwrap();
        let state = match classes.get_mut(class) {
            Some(state) => state,
            None => return false,
        };

        let now = Instant::now();
        if now >= state.bucket.window_reset {
            state.bucket.count = 0;
            state.bucket.window_reset = now + state.config.interval;
        }

        if state.slot.pending.is_some() {
            // A flush is already scheduled; the latest payload wins.
            state.slot.pending = Some(payload);
            return true;
        }

        if state.bucket.count >= state.config.max_per_window {
            counter!("proxy_aggregator_dropped_total").increment(1);
            debug!("aggregator dropped {} event, window budget spent", class);
            return false;
        }

        state.bucket.count += 1;
        state.slot.pending = Some(payload);

        let inner = self.inner.clone();
        let class = class.to_string();
        let delay = self.inner.flush_delay;
        state.slot.flush_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush(&class);
        }));

        true
    }

    /// Cancel all pending flushes and drop buffered payloads. Called on
    /// session teardown.
    pub fn clear(&self) {
        let mut classes = self.inner.classes.lock().unwrap();
        for state in classes.values_mut() {
            if let Some(task) = state.slot.flush_task.take() {
                task.abort();
            }
            state.slot.pending = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aggregator_with(
        class: &str,
        interval: Duration,
        max: u32,
        names: &[&str],
    ) -> (EventAggregator, mpsc::UnboundedReceiver<DownstreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let classes = HashMap::from([(class.to_string(), ClassConfig::new(interval, max, names))]);
        (EventAggregator::new(tx, classes), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DownstreamEvent>) -> Vec<DownstreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_latest_payload() {
        let (agg, mut rx) =
            aggregator_with("candles", Duration::from_millis(500), 5, &["candles"]);

        for i in 0..50 {
            assert!(agg.admit("candles", json!({"seq": i})));
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "candles");
        assert_eq!(events[0].data, json!({"seq": 49}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_budget_bounds_emissions() {
        let (agg, mut rx) =
            aggregator_with("candles", Duration::from_millis(500), 5, &["candles"]);

        // Sustained stream: ~45 admissions over ~450 ms, off the flush grid.
        tokio::time::sleep(Duration::from_millis(7)).await;
        for i in 0..45 {
            agg.admit("candles", json!({"seq": i}));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let events = drain(&mut rx);
        assert!(
            events.len() <= 5,
            "expected at most 5 emissions, got {}",
            events.len()
        );
        assert_eq!(events.last().unwrap().data, json!({"seq": 44}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_drops_and_window_reset_readmits() {
        let (agg, mut rx) = aggregator_with("candles", Duration::from_millis(300), 1, &["candles"]);

        assert!(agg.admit("candles", json!(1)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(drain(&mut rx).len(), 1);

        // Budget spent, no flush pending: dropped.
        assert!(!agg.admit("candles", json!(2)));

        // Window expiry resets the count before admission.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(agg.admit("candles", json!(3)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, json!(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trio_emitted_in_order_with_same_payload() {
        let (agg, mut rx) = aggregator_with(
            "balance-changed",
            Duration::from_millis(1000),
            4,
            &["balance", "balance-changed", "current-balance"],
        );

        let payload = json!({"msg": {"current_balance": {"id": "b", "amount": 100, "currency": "USD"}}});
        assert!(agg.admit("balance-changed", payload.clone()));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let events = drain(&mut rx);
        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["balance", "balance-changed", "current-balance"]);
        assert!(events.iter().all(|e| e.data == payload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_pending_flush() {
        let (agg, mut rx) =
            aggregator_with("candles", Duration::from_millis(500), 5, &["candles"]);

        assert!(agg.admit("candles", json!(1)));
        agg.clear();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_class_is_not_handled() {
        let (agg, _rx) = aggregator_with("candles", Duration::from_millis(500), 5, &["candles"]);
        assert!(agg.handles("candles"));
        assert!(!agg.handles("subscription"));
        assert!(!agg.admit("subscription", json!(1)));
    }
}
