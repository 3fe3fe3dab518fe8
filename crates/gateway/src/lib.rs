//! Per-client WebSocket fan-out proxy for the upstream trading service.
//!
//! Each downstream client gets a dedicated upstream session. The gateway:
//! - accepts WebSocket connections and routes event-named JSON commands
//! - maintains one upstream link per authenticated session
//! - translates downstream commands into the upstream wire protocol
//! - normalizes upstream balance and candle shapes
//! - rate-limits and coalesces high-frequency event classes
//!
//! ## Architecture
//!
//! ```text
//! downstream client ⇄ ws_server (axum)
//!                        │ commands          egress events
//!                        ▼                       ▲
//!                  SessionMediator ── EventAggregator
//!                        │
//!                   UpstreamLink ⇄ upstream trading WebSocket
//! ```

pub mod aggregator;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod ws_server;

pub use aggregator::{ClassConfig, EventAggregator};
pub use error::{GatewayError, Result};
pub use protocol::{AuthenticateRequest, ClientCommand, DownstreamEvent};
pub use registry::{OrderAccess, SessionId, SessionIndex};
pub use session::{Session, SessionConfig};
pub use ws_server::{create_router, AppState};
