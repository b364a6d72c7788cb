//! Parley client core.
//!
//! Wires the crypto, store and protocol crates to the relay:
//! - `transport`: shared websocket connections with reconnect and auth fallback
//! - `controller`: decrypt, cache and fan out inbound messages; encrypt sends
//! - `api`: public-key directory and history REST collaborators
//! - `config`: TOML client configuration

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod transport;

pub use api::{HistoryApi, RestApi};
pub use config::{ClientConfig, TransportConfig};
pub use controller::{ControllerDeps, ConversationController, ConversationEvent};
pub use error::{ApiError, ConfigError, ControllerError, TransportError};
pub use transport::{
    ConnectionManager, ConnectionState, ConnectionTarget, StaticToken, TokenProvider, WsConnector,
};
