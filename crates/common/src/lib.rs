//! Common types and the upstream connection manager for the trading proxy.

pub mod error;
pub mod frame;
pub mod link;

pub use error::Error;
pub use frame::UpstreamFrame;
pub use link::{
    CloseReason, FrameHandler, LinkCommand, LinkConfig, LinkState, LinkStateHandle, UpstreamLink,
};
