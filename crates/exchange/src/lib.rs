//! Upstream trading-exchange protocol: wire frame builders, the asset
//! registry, and order construction.

pub mod assets;
pub mod error;
pub mod orders;
pub mod wire;

pub use assets::AssetRegistry;
pub use error::{ExchangeError, Result};
pub use orders::{Direction, OpenPositionRequest, OrderContext, OrderEnvelope, Timeframe};
