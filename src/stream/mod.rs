//! Live balance and transaction feed from the full node

pub mod messages;
pub mod transport;
pub mod websocket;

pub use messages::{InboundFrame, OutboundFrame};
pub use transport::{Channel, Connector, WebSocketConnector};
pub use websocket::{EventStream, ReconnectPolicy, StreamHandler, StreamState};
