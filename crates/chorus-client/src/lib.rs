//! Client side of the relay: one reconnecting WebSocket session per user
//! with a bounded local buffer of recent notifications.

pub mod buffer;
mod client;
pub mod error;
pub mod policy;
pub mod transport;

pub use buffer::{BufferedNotification, NotificationBuffer};
pub use client::{ClientConfig, ClientHandle, ConnectionStatus, RelayClient};
pub use error::ClientError;
pub use policy::{ReconnectDecision, ReconnectPolicy, ReconnectState};
pub use transport::{Connector, FrameSink, FrameStream, WsConnector};
