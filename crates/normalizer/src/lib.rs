//! Normalization of upstream event shapes into the stable downstream schema.

pub mod balance;
pub mod candle;
pub mod schema;

pub use balance::normalize_balance;
pub use candle::normalize_candle;
pub use schema::{AccountFlavor, CanonicalBalance};
